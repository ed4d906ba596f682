use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "compaction_records")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub session_id: i64,
    pub at: OffsetDateTime,
    pub tokens_before: i64,
    pub tokens_after: i64,
    pub strategy: String,
    pub messages_kept: i32,
    pub messages_dropped: i32,
    pub created_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "session_id", to = "id", on_delete = "Cascade")]
    pub session: HasOne<super::sessions::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
