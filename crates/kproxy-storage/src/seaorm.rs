#![allow(clippy::needless_update)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectionTrait, Database, DatabaseBackend,
    DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Schema, TransactionTrait,
};
use time::OffsetDateTime;

use crate::entities;
use crate::store::{
    MetricUsagePatch, NewCompaction, NewMemory, NewMetric, NewRoutingDecision, NewSession, Store,
    StoreError, StoreResult,
};

/// SeaORM-backed store. Runtime hot paths write small rows directly; writes
/// that touch one session take that session's async lock so metric patches
/// and compaction records never interleave.
pub struct SeaOrmStore {
    db: DatabaseConnection,
    session_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl SeaOrmStore {
    pub async fn connect(dsn: &str) -> StoreResult<Self> {
        let db = Database::connect(dsn).await?;
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self {
            db,
            session_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    fn session_lock(&self, session_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self
            .session_locks
            .lock()
            .expect("session lock registry poisoned");
        guard
            .entry(session_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl Store for SeaOrmStore {
    async fn sync(&self) -> StoreResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Sessions)
            .register(entities::Metrics)
            .register(entities::MaskedBlobs)
            .register(entities::CompactionRecords)
            .register(entities::MemoryEntries)
            .register(entities::RoutingDecisions)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    async fn create_session(&self, new: NewSession) -> StoreResult<entities::sessions::Model> {
        let now = OffsetDateTime::now_utc();
        let result = self
            .db
            .transaction(move |txn| {
                Box::pin(async move {
                    // Exactly one active session: demote the rest first.
                    let currently_active = entities::Sessions::find()
                        .filter(entities::sessions::Column::Active.eq(true))
                        .all(txn)
                        .await?;
                    for row in currently_active {
                        let mut active: entities::sessions::ActiveModel = row.into();
                        active.active = ActiveValue::Set(false);
                        active.update(txn).await?;
                    }

                    let active = entities::sessions::ActiveModel {
                        id: ActiveValue::NotSet,
                        name: ActiveValue::Set(new.name),
                        provider_key: ActiveValue::Set(new.provider_key),
                        model_key: ActiveValue::Set(new.model_key),
                        max_context: ActiveValue::Set(new.max_context),
                        reserved_tokens: ActiveValue::Set(new.reserved_tokens),
                        auto_compact: ActiveValue::Set(new.auto_compact),
                        auto_compact_threshold: ActiveValue::Set(new.auto_compact_threshold),
                        context_precheck: ActiveValue::Set(new.context_precheck),
                        active: ActiveValue::Set(true),
                        deleted: ActiveValue::Set(false),
                        created_at: ActiveValue::Set(now),
                        ..Default::default()
                    };
                    let inserted = entities::Sessions::insert(active).exec(txn).await?;
                    entities::Sessions::find_by_id(inserted.last_insert_id)
                        .one(txn)
                        .await
                })
            })
            .await;

        match result {
            Ok(Some(model)) => Ok(model),
            Ok(None) => Err(StoreError::NotFound("session")),
            Err(sea_orm::TransactionError::Connection(err)) => Err(err.into()),
            Err(sea_orm::TransactionError::Transaction(err)) => Err(err.into()),
        }
    }

    async fn session(&self, id: i64) -> StoreResult<Option<entities::sessions::Model>> {
        Ok(entities::Sessions::find_by_id(id).one(&self.db).await?)
    }

    async fn active_session(&self) -> StoreResult<Option<entities::sessions::Model>> {
        Ok(entities::Sessions::find()
            .filter(entities::sessions::Column::Active.eq(true))
            .filter(entities::sessions::Column::Deleted.eq(false))
            .one(&self.db)
            .await?)
    }

    async fn list_sessions(&self) -> StoreResult<Vec<entities::sessions::Model>> {
        Ok(entities::Sessions::find()
            .filter(entities::sessions::Column::Deleted.eq(false))
            .order_by_asc(entities::sessions::Column::Id)
            .all(&self.db)
            .await?)
    }

    async fn activate_session(&self, id: i64) -> StoreResult<entities::sessions::Model> {
        let result = self
            .db
            .transaction(move |txn| {
                Box::pin(async move {
                    let target = entities::Sessions::find_by_id(id).one(txn).await?;
                    let Some(target) = target else {
                        return Ok::<_, sea_orm::DbErr>(None);
                    };
                    let others = entities::Sessions::find()
                        .filter(entities::sessions::Column::Active.eq(true))
                        .all(txn)
                        .await?;
                    for row in others {
                        if row.id == id {
                            continue;
                        }
                        let mut active: entities::sessions::ActiveModel = row.into();
                        active.active = ActiveValue::Set(false);
                        active.update(txn).await?;
                    }
                    let mut active: entities::sessions::ActiveModel = target.into();
                    active.active = ActiveValue::Set(true);
                    let updated = active.update(txn).await?;
                    Ok(Some(updated))
                })
            })
            .await;

        match result {
            Ok(Some(model)) => Ok(model),
            Ok(None) => Err(StoreError::NotFound("session")),
            Err(sea_orm::TransactionError::Connection(err)) => Err(err.into()),
            Err(sea_orm::TransactionError::Transaction(err)) => Err(err.into()),
        }
    }

    async fn set_auto_compact(&self, id: i64, enabled: bool) -> StoreResult<bool> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let row = entities::Sessions::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or(StoreError::NotFound("session"))?;
        let mut active: entities::sessions::ActiveModel = row.into();
        active.auto_compact = ActiveValue::Set(enabled);
        let updated = active.update(&self.db).await?;
        Ok(updated.auto_compact)
    }

    async fn soft_delete_session(&self, id: i64) -> StoreResult<()> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let row = entities::Sessions::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or(StoreError::NotFound("session"))?;
        let mut active: entities::sessions::ActiveModel = row.into();
        active.deleted = ActiveValue::Set(true);
        active.active = ActiveValue::Set(false);
        active.update(&self.db).await?;
        Ok(())
    }

    async fn append_metric(&self, new: NewMetric) -> StoreResult<i64> {
        let lock = self.session_lock(new.session_id);
        let _guard = lock.lock().await;

        let now = OffsetDateTime::now_utc();
        let active = entities::metrics::ActiveModel {
            id: ActiveValue::NotSet,
            session_id: ActiveValue::Set(new.session_id),
            at: ActiveValue::Set(now),
            prompt_tokens: ActiveValue::Set(None),
            completion_tokens: ActiveValue::Set(None),
            estimated_input_tokens: ActiveValue::Set(new.estimated_input_tokens),
            is_estimated: ActiveValue::Set(true),
            source: ActiveValue::Set(new.source),
            finish_reason: ActiveValue::Set(None),
            created_at: ActiveValue::Set(now),
            ..Default::default()
        };
        let inserted = entities::Metrics::insert(active).exec(&self.db).await?;
        Ok(inserted.last_insert_id)
    }

    async fn finish_metric(&self, metric_id: i64, patch: MetricUsagePatch) -> StoreResult<()> {
        let row = entities::Metrics::find_by_id(metric_id)
            .one(&self.db)
            .await?
            .ok_or(StoreError::NotFound("metric"))?;

        let lock = self.session_lock(row.session_id);
        let _guard = lock.lock().await;

        let mut active: entities::metrics::ActiveModel = row.into();
        active.prompt_tokens = ActiveValue::Set(patch.prompt_tokens);
        active.completion_tokens = ActiveValue::Set(patch.completion_tokens);
        active.is_estimated = ActiveValue::Set(patch.is_estimated);
        active.finish_reason = ActiveValue::Set(patch.finish_reason);
        active.update(&self.db).await?;
        Ok(())
    }

    async fn session_metrics(&self, session_id: i64) -> StoreResult<Vec<entities::metrics::Model>> {
        Ok(entities::Metrics::find()
            .filter(entities::metrics::Column::SessionId.eq(session_id))
            .order_by_asc(entities::metrics::Column::Id)
            .all(&self.db)
            .await?)
    }

    async fn recent_metrics(&self, limit: u64) -> StoreResult<Vec<entities::metrics::Model>> {
        let mut rows = entities::Metrics::find()
            .order_by_desc(entities::metrics::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?;
        rows.reverse();
        Ok(rows)
    }

    async fn absorb_log_metric(
        &self,
        session_id: i64,
        at: OffsetDateTime,
        prompt_tokens: i64,
        completion_tokens: i64,
    ) -> StoreResult<Option<i64>> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let shadowed = entities::Metrics::find()
            .filter(entities::metrics::Column::SessionId.eq(session_id))
            .filter(entities::metrics::Column::Source.eq("proxy"))
            .filter(entities::metrics::Column::At.eq(at))
            .one(&self.db)
            .await?;
        if shadowed.is_some() {
            return Ok(None);
        }

        let active = entities::metrics::ActiveModel {
            id: ActiveValue::NotSet,
            session_id: ActiveValue::Set(session_id),
            at: ActiveValue::Set(at),
            prompt_tokens: ActiveValue::Set(Some(prompt_tokens)),
            completion_tokens: ActiveValue::Set(Some(completion_tokens)),
            estimated_input_tokens: ActiveValue::Set(prompt_tokens),
            is_estimated: ActiveValue::Set(false),
            source: ActiveValue::Set("log".to_string()),
            finish_reason: ActiveValue::Set(None),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        let inserted = entities::Metrics::insert(active).exec(&self.db).await?;
        Ok(Some(inserted.last_insert_id))
    }

    async fn put_masked_blob(
        &self,
        content_hash: &str,
        original_tokens: i64,
        preview: &str,
        tags: serde_json::Value,
    ) -> StoreResult<()> {
        use entities::masked_blobs::Column;

        let active = entities::masked_blobs::ActiveModel {
            id: ActiveValue::NotSet,
            content_hash: ActiveValue::Set(content_hash.to_string()),
            original_tokens: ActiveValue::Set(original_tokens),
            preview: ActiveValue::Set(preview.to_string()),
            tags: ActiveValue::Set(tags),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        entities::MaskedBlobs::insert(active)
            .on_conflict(
                OnConflict::column(Column::ContentHash)
                    .update_columns([Column::OriginalTokens, Column::Preview, Column::Tags])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn masked_blob(
        &self,
        content_hash: &str,
    ) -> StoreResult<Option<entities::masked_blobs::Model>> {
        Ok(entities::MaskedBlobs::find()
            .filter(entities::masked_blobs::Column::ContentHash.eq(content_hash))
            .one(&self.db)
            .await?)
    }

    async fn evict_masked_blobs_before(&self, cutoff: OffsetDateTime) -> StoreResult<u64> {
        let deleted = entities::MaskedBlobs::delete_many()
            .filter(entities::masked_blobs::Column::CreatedAt.lt(cutoff))
            .exec(&self.db)
            .await?;
        Ok(deleted.rows_affected)
    }

    async fn append_compaction(&self, new: NewCompaction) -> StoreResult<()> {
        let lock = self.session_lock(new.session_id);
        let _guard = lock.lock().await;

        let now = OffsetDateTime::now_utc();
        let active = entities::compaction_records::ActiveModel {
            id: ActiveValue::NotSet,
            session_id: ActiveValue::Set(new.session_id),
            at: ActiveValue::Set(now),
            tokens_before: ActiveValue::Set(new.tokens_before),
            tokens_after: ActiveValue::Set(new.tokens_after),
            strategy: ActiveValue::Set(new.strategy),
            messages_kept: ActiveValue::Set(new.messages_kept),
            messages_dropped: ActiveValue::Set(new.messages_dropped),
            created_at: ActiveValue::Set(now),
            ..Default::default()
        };
        entities::CompactionRecords::insert(active)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn last_compaction(
        &self,
        session_id: i64,
    ) -> StoreResult<Option<entities::compaction_records::Model>> {
        Ok(entities::CompactionRecords::find()
            .filter(entities::compaction_records::Column::SessionId.eq(session_id))
            .order_by_desc(entities::compaction_records::Column::Id)
            .one(&self.db)
            .await?)
    }

    async fn put_memory(&self, new: NewMemory) -> StoreResult<i64> {
        let now = OffsetDateTime::now_utc();
        let active = entities::memory_entries::ActiveModel {
            id: ActiveValue::NotSet,
            session_id: ActiveValue::Set(new.session_id),
            kind: ActiveValue::Set(new.kind),
            content: ActiveValue::Set(new.content),
            token_count: ActiveValue::Set(new.token_count),
            access_count: ActiveValue::Set(0),
            created_at: ActiveValue::Set(now),
            last_accessed_at: ActiveValue::Set(now),
            ..Default::default()
        };
        let inserted = entities::MemoryEntries::insert(active).exec(&self.db).await?;
        Ok(inserted.last_insert_id)
    }

    async fn fetch_memories(
        &self,
        session_id: i64,
        promote_threshold: i64,
    ) -> StoreResult<Vec<entities::memory_entries::Model>> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let rows = entities::MemoryEntries::find()
            .filter(entities::memory_entries::Column::SessionId.eq(session_id))
            .order_by_asc(entities::memory_entries::Column::Id)
            .all(&self.db)
            .await?;

        let now = OffsetDateTime::now_utc();
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let bumped = row.access_count + 1;
            let promote = row.kind == "episodic" && bumped >= promote_threshold;
            let mut active: entities::memory_entries::ActiveModel = row.into();
            active.access_count = ActiveValue::Set(bumped);
            active.last_accessed_at = ActiveValue::Set(now);
            if promote {
                active.kind = ActiveValue::Set("frequent".to_string());
            }
            out.push(active.update(&self.db).await?);
        }
        Ok(out)
    }

    async fn record_routing_decision(&self, new: NewRoutingDecision) -> StoreResult<()> {
        let now = OffsetDateTime::now_utc();
        let active = entities::routing_decisions::ActiveModel {
            id: ActiveValue::NotSet,
            at: ActiveValue::Set(now),
            session_id: ActiveValue::Set(new.session_id),
            client_model: ActiveValue::Set(new.client_model),
            provider_key: ActiveValue::Set(new.provider_key),
            upstream_model: ActiveValue::Set(new.upstream_model),
            base_url: ActiveValue::Set(new.base_url),
            created_at: ActiveValue::Set(now),
            ..Default::default()
        };
        entities::RoutingDecisions::insert(active).exec(&self.db).await?;
        Ok(())
    }
}
