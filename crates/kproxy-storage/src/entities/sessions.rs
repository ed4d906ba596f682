use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Conversation bound to one provider/model. Provider and model fields are
/// immutable after creation; a change means a new row. Soft-deleted only.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    pub provider_key: String,
    pub model_key: Option<String>,
    pub max_context: i64,
    pub reserved_tokens: i64,
    pub auto_compact: bool,
    pub auto_compact_threshold: f64,
    pub context_precheck: bool,
    pub active: bool,
    pub deleted: bool,
    pub created_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub metrics: HasMany<super::metrics::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
