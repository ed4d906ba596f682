use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Audit of one routing resolution: which client model went to which
/// upstream. Append-only.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "routing_decisions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub at: OffsetDateTime,
    pub session_id: Option<i64>,
    pub client_model: String,
    pub provider_key: String,
    pub upstream_model: String,
    pub base_url: String,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
