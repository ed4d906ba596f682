use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Stored replacement body for an over-long tool/console message, addressed
/// by content hash. Written by the sanitizer, read on explicit fetch,
/// evicted by age.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "masked_blobs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "masked_blob_content_hash")]
    pub content_hash: String,
    pub original_tokens: i64,
    pub preview: String,
    pub tags: Json,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
