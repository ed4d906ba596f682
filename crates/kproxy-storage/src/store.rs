use async_trait::async_trait;
use time::OffsetDateTime;

use crate::entities::{compaction_records, masked_blobs, memory_entries, metrics, sessions};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub name: String,
    pub provider_key: String,
    pub model_key: Option<String>,
    pub max_context: i64,
    pub reserved_tokens: i64,
    pub auto_compact: bool,
    pub auto_compact_threshold: f64,
    pub context_precheck: bool,
}

#[derive(Debug, Clone)]
pub struct NewMetric {
    pub session_id: i64,
    pub estimated_input_tokens: i64,
    pub source: String,
}

/// The single patch a pending metric receives when its stream settles.
#[derive(Debug, Clone, Default)]
pub struct MetricUsagePatch {
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub is_estimated: bool,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewCompaction {
    pub session_id: i64,
    pub tokens_before: i64,
    pub tokens_after: i64,
    pub strategy: String,
    pub messages_kept: i32,
    pub messages_dropped: i32,
}

#[derive(Debug, Clone)]
pub struct NewMemory {
    pub session_id: i64,
    pub kind: String,
    pub content: String,
    pub token_count: i64,
}

#[derive(Debug, Clone)]
pub struct NewRoutingDecision {
    pub session_id: Option<i64>,
    pub client_model: String,
    pub provider_key: String,
    pub upstream_model: String,
    pub base_url: String,
}

/// Durable ownership of sessions, metrics, masked blobs, compaction records,
/// memory entries and routing decisions. Writes to one session are
/// serialized; reads run concurrently.
#[async_trait]
pub trait Store: Send + Sync {
    /// Entity-first additive schema sync, run once at bootstrap.
    async fn sync(&self) -> StoreResult<()>;

    // Sessions
    async fn create_session(&self, new: NewSession) -> StoreResult<sessions::Model>;
    async fn session(&self, id: i64) -> StoreResult<Option<sessions::Model>>;
    async fn active_session(&self) -> StoreResult<Option<sessions::Model>>;
    async fn list_sessions(&self) -> StoreResult<Vec<sessions::Model>>;
    async fn activate_session(&self, id: i64) -> StoreResult<sessions::Model>;
    async fn set_auto_compact(&self, id: i64, enabled: bool) -> StoreResult<bool>;
    async fn soft_delete_session(&self, id: i64) -> StoreResult<()>;

    // Metrics
    async fn append_metric(&self, new: NewMetric) -> StoreResult<i64>;
    async fn finish_metric(&self, metric_id: i64, patch: MetricUsagePatch) -> StoreResult<()>;
    async fn session_metrics(&self, session_id: i64) -> StoreResult<Vec<metrics::Model>>;
    async fn recent_metrics(&self, limit: u64) -> StoreResult<Vec<metrics::Model>>;
    /// Absorb a log-watched metric. Proxy rows win: the row is only written
    /// when the session has no proxy-side metric at the same instant.
    /// Returns the new row id, or `None` when a proxy row shadowed it.
    async fn absorb_log_metric(
        &self,
        session_id: i64,
        at: OffsetDateTime,
        prompt_tokens: i64,
        completion_tokens: i64,
    ) -> StoreResult<Option<i64>>;

    // Masked blobs
    async fn put_masked_blob(
        &self,
        content_hash: &str,
        original_tokens: i64,
        preview: &str,
        tags: serde_json::Value,
    ) -> StoreResult<()>;
    async fn masked_blob(&self, content_hash: &str) -> StoreResult<Option<masked_blobs::Model>>;
    async fn evict_masked_blobs_before(&self, cutoff: OffsetDateTime) -> StoreResult<u64>;

    // Compaction audit
    async fn append_compaction(&self, new: NewCompaction) -> StoreResult<()>;
    async fn last_compaction(
        &self,
        session_id: i64,
    ) -> StoreResult<Option<compaction_records::Model>>;

    // Memory
    async fn put_memory(&self, new: NewMemory) -> StoreResult<i64>;
    /// Fetch a session's memories, bumping access counters and promoting
    /// episodic entries whose counter crosses `promote_threshold`.
    async fn fetch_memories(
        &self,
        session_id: i64,
        promote_threshold: i64,
    ) -> StoreResult<Vec<memory_entries::Model>>;

    // Routing audit
    async fn record_routing_decision(&self, new: NewRoutingDecision) -> StoreResult<()>;
}
