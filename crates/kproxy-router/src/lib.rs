mod api;
mod proxy;
mod ws;

use std::sync::Arc;

use axum::Router;

use kproxy_accounting::Tokenizer;
use kproxy_common::ProxyConfig;
use kproxy_core::compactor::Compactor;
use kproxy_core::mcp::McpGateway;
use kproxy_core::{Bootstrap, ObserverHub, ProxyEngine, SessionRegistry};
use kproxy_storage::Store;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub engine: Arc<ProxyEngine>,
    pub registry: Arc<SessionRegistry>,
    pub compactor: Arc<Compactor>,
    pub store: Arc<dyn Store>,
    pub hub: ObserverHub,
    pub gateway: Arc<McpGateway>,
    pub tokenizer: Tokenizer,
}

impl AppState {
    pub fn from_bootstrap(boot: &Bootstrap) -> Self {
        Self {
            config: boot.config.clone(),
            engine: boot.engine.clone(),
            registry: boot.registry.clone(),
            compactor: boot.compactor.clone(),
            store: boot.store.clone(),
            hub: boot.hub.clone(),
            gateway: boot.gateway.clone(),
            tokenizer: boot.tokenizer.clone(),
        }
    }
}

/// The full HTTP surface: OpenAI-compatible proxy routes, the `/api`
/// management surface, and the `/ws` observer channel.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .merge(proxy::routes())
        .merge(api::routes())
        .merge(ws::routes())
        .with_state(state)
}
