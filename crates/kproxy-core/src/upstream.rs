use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use serde::Serialize;
use wreq::{Client, Method, Proxy};

pub type Headers = Vec<(String, String)>;

/// Fault observed mid-stream, after headers were already relayed. Travels
/// in-band through the chunk channel so the relay can commit partial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFault {
    IdleTimeout,
    ReadError,
}

pub type ChunkReceiver = tokio::sync::mpsc::Receiver<Result<Bytes, StreamFault>>;

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ChunkReceiver),
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
    pub timeouts: TimeoutProfile,
}

/// Per-provider timeout budget; also the client-cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutProfile {
    pub connect_secs: u64,
    pub request_secs: u64,
    pub stream_idle_secs: u64,
}

impl TimeoutProfile {
    pub fn stream_idle(&self) -> Duration {
        Duration::from_secs(self.stream_idle_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Dns,
    Tls,
    Other,
}

#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>>;
}

/// wreq-backed client. One `Client` per timeout profile, built lazily and
/// cached; wreq clients are cheap to clone and share their pool.
pub struct WreqUpstreamClient {
    chunk_capacity: usize,
    outbound_proxy: Option<String>,
    clients: Mutex<HashMap<TimeoutProfile, Client>>,
}

impl WreqUpstreamClient {
    pub fn new(chunk_capacity: usize, outbound_proxy: Option<String>) -> Self {
        Self {
            chunk_capacity: chunk_capacity.max(1),
            outbound_proxy,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, profile: TimeoutProfile) -> Result<Client, TransportError> {
        let mut guard = self.clients.lock().map_err(|_| TransportError {
            kind: TransportErrorKind::Other,
            message: "upstream client cache lock failed".to_string(),
        })?;
        if let Some(client) = guard.get(&profile) {
            return Ok(client.clone());
        }
        let client = build_client(&profile, self.outbound_proxy.as_deref())
            .map_err(map_wreq_error)?;
        guard.insert(profile, client.clone());
        Ok(client)
    }
}

fn build_client(profile: &TimeoutProfile, proxy: Option<&str>) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder()
        .connect_timeout(Duration::from_secs(profile.connect_secs))
        .timeout(Duration::from_secs(profile.request_secs))
        .read_timeout(Duration::from_secs(profile.stream_idle_secs));
    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }
    builder.build()
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let client = self.client_for(req.timeouts)?;
            let method = match req.method {
                HttpMethod::Get => Method::GET,
                HttpMethod::Post => Method::POST,
            };
            let mut builder = client.request(method, &req.url);
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = req.body {
                builder = builder.body(body);
            }

            let resp = builder.send().await.map_err(map_wreq_error)?;
            convert_response(resp, req.is_stream, req.timeouts.stream_idle(), self.chunk_capacity)
                .await
        })
    }
}

async fn convert_response(
    resp: wreq::Response,
    want_stream: bool,
    idle_timeout: Duration,
    chunk_capacity: usize,
) -> Result<UpstreamResponse, TransportError> {
    let status = resp.status().as_u16();
    let headers = collect_headers(resp.headers());

    // Error and non-streaming bodies are small; collect them whole so the
    // caller can forward or decode them verbatim.
    if !(200..300).contains(&status) || !want_stream {
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        return Ok(UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        });
    }

    let (tx, rx) = tokio::sync::mpsc::channel(chunk_capacity);
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        loop {
            let next = tokio::time::timeout(idle_timeout, stream.next()).await;
            let item = match next {
                Ok(item) => item,
                Err(_) => {
                    let _ = tx.send(Err(StreamFault::IdleTimeout)).await;
                    break;
                }
            };
            let Some(item) = item else {
                // Clean upstream EOF: the channel closes without a fault.
                break;
            };
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(_) => {
                    let _ = tx.send(Err(StreamFault::ReadError)).await;
                    break;
                }
            };
            if tx.send(Ok(chunk)).await.is_err() {
                // Downstream receiver dropped: caller went away, stop reading.
                break;
            }
        }
    });

    Ok(UpstreamResponse {
        status,
        headers,
        body: UpstreamBody::Stream(rx),
    })
}

fn collect_headers(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (name, value) in map {
        if let Ok(text) = value.to_str() {
            out.push((name.as_str().to_string(), text.to_string()));
        }
    }
    out
}

fn map_wreq_error(err: wreq::Error) -> TransportError {
    TransportError {
        kind: classify_wreq_error(&err),
        message: err.to_string(),
    }
}

fn classify_wreq_error(err: &wreq::Error) -> TransportErrorKind {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        return TransportErrorKind::Timeout;
    }
    if err.is_connect() {
        if message.contains("dns") || message.contains("resolve") {
            return TransportErrorKind::Dns;
        }
        if message.contains("tls") || message.contains("ssl") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }
    if err.is_connection_reset() {
        return TransportErrorKind::Connect;
    }
    TransportErrorKind::Other
}
