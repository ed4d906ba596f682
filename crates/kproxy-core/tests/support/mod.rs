#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use kproxy_accounting::Tokenizer;
use kproxy_common::ProxyConfig;
use kproxy_core::compactor::{CompactionPolicy, Compactor, PlaceholderSummarizer};
use kproxy_core::engine::ProxyEngine;
use kproxy_core::hub::ObserverHub;
use kproxy_core::routing::Router;
use kproxy_core::state::SessionRegistry;
use kproxy_core::upstream::{
    StreamFault, TransportError, TransportErrorKind, UpstreamBody, UpstreamClient,
    UpstreamRequest, UpstreamResponse,
};
use kproxy_storage::SeaOrmStore;

static DB_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub async fn temp_store() -> Arc<SeaOrmStore> {
    let path = std::env::temp_dir().join(format!(
        "kproxy-test-{}-{}.db",
        std::process::id(),
        DB_COUNTER.fetch_add(1, Ordering::SeqCst),
    ));
    let _ = std::fs::remove_file(&path);
    let dsn = format!("sqlite://{}?mode=rwc", path.display());
    let store = Arc::new(SeaOrmStore::connect(&dsn).await.expect("connect sqlite"));
    use kproxy_storage::Store;
    store.sync().await.expect("schema sync");
    store
}

const FIXTURE_CONFIG: &str = r#"
[server]
host = "127.0.0.1"
port = 8100

[providers.pa]
type = "openai-compatible"
base_url = "http://fixture"
credential = "sk-fixture"

[providers.pb]
type = "openai-compatible"
base_url = "http://fallback-fixture"
credential = "sk-fallback"

[providers.selfish]
type = "openai-compatible"
base_url = "http://127.0.0.1:8100"

[providers.gem]
type = "gemini-native"
base_url = "http://gemini-fixture"
credential = "gk"

[models."alias/x"]
provider = "pa"
upstream = "real-x"
max_context = 1000

[models."loop/x"]
provider = "selfish"
upstream = "x"
max_context = 1000

[models."gem/x"]
provider = "gem"
upstream = "gemini-x"
max_context = 1000

[models."tiny/x"]
provider = "pa"
upstream = "tiny-x"
max_context = 40
"#;

pub fn fixture_config() -> ProxyConfig {
    let mut config = ProxyConfig::from_toml(FIXTURE_CONFIG, |_| None).expect("fixture config");
    // The pa provider falls back to pb on a second 5xx retry.
    config.providers.get_mut("pa").unwrap().fallback = Some("pb".to_string());
    config
}

/// One scripted upstream interaction, consumed per `send` call.
pub enum Script {
    Transport(TransportErrorKind),
    Response { status: u16, body: &'static str },
    Stream(Vec<Result<Bytes, StreamFault>>),
}

/// Upstream client that replays a script instead of dialing anything.
pub struct StubClient {
    script: Mutex<VecDeque<Script>>,
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl StubClient {
    pub fn new(script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

impl UpstreamClient for StubClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(req.url.clone());
        let step = self.script.lock().unwrap().pop_front();
        Box::pin(async move {
            match step {
                None => Err(TransportError {
                    kind: TransportErrorKind::Other,
                    message: "script exhausted".to_string(),
                }),
                Some(Script::Transport(kind)) => Err(TransportError {
                    kind,
                    message: "scripted transport failure".to_string(),
                }),
                Some(Script::Response { status, body }) => Ok(UpstreamResponse {
                    status,
                    headers: vec![("content-type".to_string(), "application/json".to_string())],
                    body: UpstreamBody::Bytes(Bytes::from_static(body.as_bytes())),
                }),
                Some(Script::Stream(chunks)) => {
                    let (tx, rx) = tokio::sync::mpsc::channel(32);
                    tokio::spawn(async move {
                        for chunk in chunks {
                            if tx.send(chunk).await.is_err() {
                                break;
                            }
                        }
                    });
                    Ok(UpstreamResponse {
                        status: 200,
                        headers: vec![(
                            "content-type".to_string(),
                            "text/event-stream".to_string(),
                        )],
                        body: UpstreamBody::Stream(rx),
                    })
                }
            }
        })
    }
}

pub struct Harness {
    pub config: Arc<ProxyConfig>,
    pub store: Arc<SeaOrmStore>,
    pub hub: ObserverHub,
    pub tokenizer: Tokenizer,
    pub registry: Arc<SessionRegistry>,
    pub compactor: Arc<Compactor>,
    pub engine: Arc<ProxyEngine>,
    pub client: Arc<StubClient>,
}

/// Wires the engine exactly the way the composition root does, with the
/// scripted client standing in for the network.
pub async fn harness(script: Vec<Script>) -> Harness {
    harness_with_config(fixture_config(), script).await
}

pub async fn harness_with_config(config: ProxyConfig, script: Vec<Script>) -> Harness {
    let config = Arc::new(config);
    let store = temp_store().await;
    let store_dyn: Arc<dyn kproxy_storage::Store> = store.clone();
    let tokenizer = Tokenizer::cl100k().expect("tokenizer");
    let hub = ObserverHub::new(config.features.hub_queue_depth);
    let registry = Arc::new(SessionRegistry::new(
        config.clone(),
        store_dyn.clone(),
        hub.clone(),
    ));
    let router = Arc::new(Router::new(
        config.clone(),
        config.server.host.clone(),
        config.server.port,
    ));
    let compactor = Arc::new(Compactor::new(
        store_dyn.clone(),
        hub.clone(),
        tokenizer.clone(),
        registry.clone(),
        CompactionPolicy::from_features(&config.features),
        Arc::new(PlaceholderSummarizer),
    ));
    let client = StubClient::new(script);
    let engine = Arc::new(ProxyEngine::new(
        config.clone(),
        router,
        client.clone(),
        store_dyn,
        hub.clone(),
        tokenizer.clone(),
        registry.clone(),
        compactor.clone(),
    ));

    Harness {
        config,
        store,
        hub,
        tokenizer,
        registry,
        compactor,
        engine,
        client,
    }
}

pub fn sse(data: &str) -> Bytes {
    Bytes::from(format!("data: {data}\n\n"))
}

pub fn chat_body(model: &str, stream: bool, content: &str) -> kproxy_protocol::openai::ChatRequest {
    serde_json::from_value(serde_json::json!({
        "model": model,
        "stream": stream,
        "messages": [{"role": "user", "content": content}],
    }))
    .expect("chat body")
}
