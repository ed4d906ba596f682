use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One chat-completion round trip. Appended on dispatch, patched once when
/// the stream settles; never rewritten afterwards.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "metrics")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub session_id: i64,
    pub at: OffsetDateTime,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub estimated_input_tokens: i64,
    pub is_estimated: bool,
    /// "proxy" for in-band rows, "log" for rows absorbed from log watching.
    pub source: String,
    pub finish_reason: Option<String>,
    pub created_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "session_id", to = "id", on_delete = "Cascade")]
    pub session: HasOne<super::sessions::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
