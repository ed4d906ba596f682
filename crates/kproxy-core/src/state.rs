use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kproxy_accounting::resolve_max_context;
use kproxy_common::{ErrorKind, ProxyConfig, ProxyError};
use kproxy_protocol::openai::ChatMessage;
use kproxy_storage::entities::sessions;
use kproxy_storage::{NewSession, Store, StoreError};

use crate::hub::{Notice, ObserverHub};

/// In-memory view of one session row. Cheap to clone into request tasks.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: i64,
    pub name: String,
    pub provider_key: String,
    pub model_key: Option<String>,
    pub max_context: i64,
    pub reserved_tokens: i64,
    pub auto_compact: bool,
    pub auto_compact_threshold: f64,
    pub context_precheck: bool,
}

impl From<sessions::Model> for SessionHandle {
    fn from(row: sessions::Model) -> Self {
        Self {
            id: row.id,
            name: row.name,
            provider_key: row.provider_key,
            model_key: row.model_key,
            max_context: row.max_context,
            reserved_tokens: row.reserved_tokens,
            auto_compact: row.auto_compact,
            auto_compact_threshold: row.auto_compact_threshold,
            context_precheck: row.context_precheck,
        }
    }
}

/// Parameters for an explicitly created session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub name: String,
    pub provider_key: String,
    pub model_key: Option<String>,
    pub reserved_tokens: i64,
    pub auto_compact: Option<bool>,
    pub auto_compact_threshold: Option<f64>,
    pub context_precheck: Option<bool>,
}

/// The single authority over "which session is active". One mutex guards the
/// active pointer; session records themselves live in the store and are
/// never mutated in place.
pub struct SessionRegistry {
    config: Arc<ProxyConfig>,
    store: Arc<dyn Store>,
    hub: ObserverHub,
    active: tokio::sync::Mutex<Option<SessionHandle>>,
    histories: Mutex<HashMap<i64, Vec<ChatMessage>>>,
    consecutive_auto_compactions: Mutex<HashMap<i64, u32>>,
    metric_commit_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    auto_session: AtomicBool,
}

impl SessionRegistry {
    pub fn new(config: Arc<ProxyConfig>, store: Arc<dyn Store>, hub: ObserverHub) -> Self {
        let auto_session = config.features.auto_session;
        Self {
            config,
            store,
            hub,
            active: tokio::sync::Mutex::new(None),
            histories: Mutex::new(HashMap::new()),
            consecutive_auto_compactions: Mutex::new(HashMap::new()),
            metric_commit_locks: Mutex::new(HashMap::new()),
            auto_session: AtomicBool::new(auto_session),
        }
    }

    /// Lock held across a metric commit and its broadcast, so observers see
    /// a session's `metric` events in commit order.
    pub fn metric_commit_lock(&self, session_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self
            .metric_commit_locks
            .lock()
            .expect("commit lock registry poisoned");
        guard
            .entry(session_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn auto_session_enabled(&self) -> bool {
        self.auto_session.load(Ordering::Relaxed)
    }

    pub fn toggle_auto_session(&self) -> bool {
        let enabled = !self.auto_session.fetch_xor(true, Ordering::Relaxed);
        self.hub.publish(Notice::AutoSessionToggled { enabled });
        enabled
    }

    /// The session a chat request runs against. A model mismatch spawns a
    /// fresh session when auto-session is on; otherwise the request rides
    /// the existing one.
    pub async fn ensure_session(
        &self,
        client_model: &str,
        model_provider: &str,
    ) -> Result<SessionHandle, ProxyError> {
        let mut active = self.active.lock().await;

        if active.is_none() {
            if let Some(row) = self
                .store
                .active_session()
                .await
                .map_err(store_error)?
            {
                *active = Some(SessionHandle::from(row));
            }
        }

        if let Some(session) = active.as_ref() {
            let matches = match &session.model_key {
                Some(model_key) => model_key == client_model,
                None => session.provider_key == model_provider,
            };
            // A mismatch with auto-session off proceeds against the existing
            // session without reassigning it.
            if matches || !self.auto_session_enabled() {
                return Ok(session.clone());
            }
        }

        let handle = self
            .create_locked(
                &mut active,
                SessionSpec {
                    name: format!("auto:{client_model}"),
                    provider_key: model_provider.to_string(),
                    model_key: Some(client_model.to_string()),
                    reserved_tokens: 0,
                    auto_compact: None,
                    auto_compact_threshold: None,
                    context_precheck: None,
                },
            )
            .await?;
        Ok(handle)
    }

    /// Explicit creation from the management surface.
    pub async fn create_session(&self, spec: SessionSpec) -> Result<SessionHandle, ProxyError> {
        let mut active = self.active.lock().await;
        self.create_locked(&mut active, spec).await
    }

    async fn create_locked(
        &self,
        active: &mut Option<SessionHandle>,
        spec: SessionSpec,
    ) -> Result<SessionHandle, ProxyError> {
        let max_context = resolve_max_context(
            &self.config,
            spec.model_key.as_deref(),
            &spec.provider_key,
        )
        .unwrap_or(0);
        if max_context <= 0 {
            return Err(ProxyError::new(
                ErrorKind::UnknownModel,
                format!(
                    "no configured model supplies a context window for provider {}",
                    spec.provider_key
                ),
            ));
        }

        let features = &self.config.features;
        let row = self
            .store
            .create_session(NewSession {
                name: spec.name,
                provider_key: spec.provider_key,
                model_key: spec.model_key,
                max_context,
                reserved_tokens: spec.reserved_tokens,
                auto_compact: spec.auto_compact.unwrap_or(features.auto_compact),
                auto_compact_threshold: spec
                    .auto_compact_threshold
                    .unwrap_or(features.auto_compact_threshold),
                context_precheck: spec
                    .context_precheck
                    .unwrap_or(features.context_precheck),
            })
            .await
            .map_err(store_error)?;

        let handle = SessionHandle::from(row);
        self.hub.publish(Notice::SessionCreated {
            session_id: handle.id,
            name: handle.name.clone(),
            provider_key: handle.provider_key.clone(),
            model_key: handle.model_key.clone(),
            max_context: handle.max_context,
        });
        *active = Some(handle.clone());
        Ok(handle)
    }

    pub async fn select_session(&self, id: i64) -> Result<SessionHandle, ProxyError> {
        let mut active = self.active.lock().await;
        let row = self.store.activate_session(id).await.map_err(store_error)?;
        let handle = SessionHandle::from(row);
        *active = Some(handle.clone());
        Ok(handle)
    }

    pub async fn active(&self) -> Option<SessionHandle> {
        self.active.lock().await.clone()
    }

    /// Keep the cached active handle in step with an auto-compact flip made
    /// through the store.
    pub async fn patch_active_auto_compact(&self, session_id: i64, enabled: bool) {
        let mut active = self.active.lock().await;
        if let Some(session) = active.as_mut() {
            if session.id == session_id {
                session.auto_compact = enabled;
            }
        }
    }

    // ---- Conversation history cache (compaction input) ----

    pub fn cache_history(&self, session_id: i64, messages: &[ChatMessage]) {
        let mut guard = self.histories.lock().expect("history cache poisoned");
        guard.insert(session_id, messages.to_vec());
    }

    pub fn history(&self, session_id: i64) -> Option<Vec<ChatMessage>> {
        let guard = self.histories.lock().expect("history cache poisoned");
        guard.get(&session_id).cloned()
    }

    pub fn replace_history(&self, session_id: i64, messages: Vec<ChatMessage>) {
        let mut guard = self.histories.lock().expect("history cache poisoned");
        guard.insert(session_id, messages);
    }

    // ---- Consecutive auto-compaction accounting ----

    pub fn auto_compaction_count(&self, session_id: i64) -> u32 {
        let guard = self
            .consecutive_auto_compactions
            .lock()
            .expect("compaction counter poisoned");
        guard.get(&session_id).copied().unwrap_or(0)
    }

    pub fn note_auto_compaction(&self, session_id: i64) -> u32 {
        let mut guard = self
            .consecutive_auto_compactions
            .lock()
            .expect("compaction counter poisoned");
        let counter = guard.entry(session_id).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn reset_auto_compactions(&self, session_id: i64) {
        let mut guard = self
            .consecutive_auto_compactions
            .lock()
            .expect("compaction counter poisoned");
        guard.remove(&session_id);
    }
}

fn store_error(err: StoreError) -> ProxyError {
    ProxyError::new(ErrorKind::StorageError, err.to_string())
}
