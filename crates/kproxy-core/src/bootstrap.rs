use std::sync::Arc;

use anyhow::Context;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::info;

use kproxy_accounting::Tokenizer;
use kproxy_common::ProxyConfig;
use kproxy_storage::{SeaOrmStore, Store};

use crate::compactor::{
    ChatSummarizer, CompactionPolicy, Compactor, PlaceholderSummarizer, Summarizer,
};
use crate::engine::ProxyEngine;
use crate::hub::ObserverHub;
use crate::mcp::McpGateway;
use crate::routing::Router;
use crate::sanitize::MaskPolicy;
use crate::state::SessionRegistry;
use crate::upstream::{UpstreamClient, WreqUpstreamClient};

/// Everything the HTTP layer needs, built once by the composition root.
pub struct Bootstrap {
    pub config: Arc<ProxyConfig>,
    pub store: Arc<SeaOrmStore>,
    pub hub: ObserverHub,
    pub tokenizer: Tokenizer,
    pub router: Arc<Router>,
    pub registry: Arc<SessionRegistry>,
    pub compactor: Arc<Compactor>,
    pub engine: Arc<ProxyEngine>,
    pub gateway: Arc<McpGateway>,
}

pub async fn bootstrap(config: ProxyConfig) -> anyhow::Result<Bootstrap> {
    let config = Arc::new(config);

    let store = Arc::new(
        SeaOrmStore::connect(&config.server.database)
            .await
            .context("connect storage")?,
    );
    store.sync().await.context("schema sync")?;
    let store_dyn: Arc<dyn Store> = store.clone();

    // Age out masked blobs once per boot; the gateway rewrites fresh ones.
    let cutoff = OffsetDateTime::now_utc() - TimeDuration::days(config.features.blob_ttl_days);
    let evicted = store_dyn
        .evict_masked_blobs_before(cutoff)
        .await
        .context("masked blob eviction")?;
    if evicted > 0 {
        info!(event = "masked_blobs_evicted", count = evicted);
    }

    let tokenizer = Tokenizer::cl100k()
        .map_err(anyhow::Error::msg)
        .context("build cl100k tokenizer")?;

    let hub = ObserverHub::new(config.features.hub_queue_depth);
    let registry = Arc::new(SessionRegistry::new(
        config.clone(),
        store_dyn.clone(),
        hub.clone(),
    ));

    let client: Arc<dyn UpstreamClient> = Arc::new(WreqUpstreamClient::new(
        config.features.chunk_channel_capacity,
        None,
    ));

    let router = Arc::new(Router::new(
        config.clone(),
        config.server.host.clone(),
        config.server.port,
    ));

    let summarizer: Arc<dyn Summarizer> = match config
        .features
        .summary_model
        .as_deref()
        .map(|model| router.resolve(model, None))
    {
        Some(Ok(route)) => Arc::new(ChatSummarizer::new(client.clone(), route)),
        Some(Err(err)) => {
            anyhow::bail!("summary_model is not routable: {err}");
        }
        None => Arc::new(PlaceholderSummarizer),
    };

    let compactor = Arc::new(Compactor::new(
        store_dyn.clone(),
        hub.clone(),
        tokenizer.clone(),
        registry.clone(),
        CompactionPolicy::from_features(&config.features),
        summarizer,
    ));

    let engine = Arc::new(ProxyEngine::new(
        config.clone(),
        router.clone(),
        client.clone(),
        store_dyn.clone(),
        hub.clone(),
        tokenizer.clone(),
        registry.clone(),
        compactor.clone(),
    ));

    let gateway = Arc::new(McpGateway::new(
        config.mcp.clone(),
        client,
        store_dyn,
        hub.clone(),
        tokenizer.clone(),
        MaskPolicy {
            threshold: config.features.sanitizer_threshold,
            head: config.features.sanitizer_head,
            tail: config.features.sanitizer_tail,
        },
    ));

    info!(
        event = "bootstrap",
        providers = config.providers.len(),
        models = config.models.len(),
        mcp_peers = config.mcp.len()
    );

    Ok(Bootstrap {
        config,
        store,
        hub,
        tokenizer,
        router,
        registry,
        compactor,
        engine,
        gateway,
    })
}
