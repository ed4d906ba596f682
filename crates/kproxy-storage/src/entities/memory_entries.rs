use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Recallable fact tied to a session. `kind` is one of
/// frequent/episodic/semantic; episodic entries are promoted to frequent
/// once their access counter crosses the configured threshold.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "memory_entries")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub session_id: i64,
    pub kind: String,
    pub content: String,
    pub token_count: i64,
    pub access_count: i64,
    pub created_at: OffsetDateTime,
    pub last_accessed_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "session_id", to = "id", on_delete = "Cascade")]
    pub session: HasOne<super::sessions::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
