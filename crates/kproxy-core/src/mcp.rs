use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::{Value, json};
use tracing::{info, warn};

use kproxy_accounting::Tokenizer;
use kproxy_common::{ErrorKind, McpPeerConfig};
use kproxy_storage::Store;

use crate::hub::{Notice, ObserverHub};
use crate::sanitize::{MaskPolicy, mask_json_strings};
use crate::upstream::{
    HttpMethod, TimeoutProfile, TransportErrorKind, UpstreamBody, UpstreamClient, UpstreamRequest,
};

const GATEWAY_TIMEOUTS: TimeoutProfile = TimeoutProfile {
    connect_secs: 10,
    request_secs: 120,
    stream_idle_secs: 60,
};

/// JSON-RPC gateway to configured local tool peers. Bodies travel verbatim
/// both ways; the only rewrite is observation masking on oversized string
/// fields in replies.
pub struct McpGateway {
    peers: BTreeMap<String, McpPeerConfig>,
    client: Arc<dyn UpstreamClient>,
    store: Arc<dyn Store>,
    hub: ObserverHub,
    tokenizer: Tokenizer,
    policy: MaskPolicy,
    reachability: Mutex<HashMap<String, bool>>,
}

pub struct GatewayReply {
    pub status: u16,
    pub body: Value,
}

impl McpGateway {
    pub fn new(
        peers: BTreeMap<String, McpPeerConfig>,
        client: Arc<dyn UpstreamClient>,
        store: Arc<dyn Store>,
        hub: ObserverHub,
        tokenizer: Tokenizer,
        policy: MaskPolicy,
    ) -> Self {
        Self {
            peers,
            client,
            store,
            hub,
            tokenizer,
            policy,
            reachability: Mutex::new(HashMap::new()),
        }
    }

    pub fn server_names(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub async fn forward(&self, server: &str, body: Bytes) -> GatewayReply {
        let request_id = serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|v| v.get("id").cloned())
            .unwrap_or(Value::Null);

        let Some(peer) = self.peers.get(server) else {
            return error_reply(ErrorKind::McpUnknownServer, &request_id, format!(
                "no MCP server named {server} is configured"
            ));
        };

        let response = self
            .client
            .send(UpstreamRequest {
                method: HttpMethod::Post,
                url: peer.url.clone(),
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: Some(body),
                is_stream: false,
                timeouts: GATEWAY_TIMEOUTS,
            })
            .await;

        let response = match response {
            Ok(response) => {
                self.note_reachability(server, true);
                response
            }
            // Only network-level failures speak to reachability; anything
            // else is a gateway-internal fault.
            Err(err) => match err.kind {
                TransportErrorKind::Timeout
                | TransportErrorKind::Connect
                | TransportErrorKind::Dns
                | TransportErrorKind::Tls => {
                    self.note_reachability(server, false);
                    return error_reply(
                        ErrorKind::McpUpstreamUnreachable,
                        &request_id,
                        format!("peer {server} unreachable: {}", err.message),
                    );
                }
                TransportErrorKind::Other => {
                    return error_reply(
                        ErrorKind::McpInternal,
                        &request_id,
                        format!("peer {server} request failed: {}", err.message),
                    );
                }
            },
        };

        let UpstreamBody::Bytes(bytes) = response.body else {
            return error_reply(
                ErrorKind::McpInternal,
                &request_id,
                "peer returned an unexpected streaming body".to_string(),
            );
        };

        let Ok(mut reply) = serde_json::from_slice::<Value>(&bytes) else {
            return error_reply(
                ErrorKind::McpInvalidUpstreamJson,
                &request_id,
                format!("peer {server} returned non-JSON ({} bytes)", bytes.len()),
            );
        };

        if !(200..300).contains(&response.status) {
            warn!(event = "mcp_peer_http_error", server, status = response.status);
            return error_reply(
                ErrorKind::McpInternal,
                &request_id,
                format!("peer {server} answered HTTP {}", response.status),
            );
        }

        // The caller's id wins, whatever the peer echoed.
        if let Some(map) = reply.as_object_mut() {
            map.insert("id".to_string(), request_id.clone());
        }
        self.mask_reply(server, &mut reply).await;

        GatewayReply {
            status: 200,
            body: reply,
        }
    }

    /// Mask oversized strings under `result` and `error.data`, persisting
    /// each original as a hash-addressed blob.
    async fn mask_reply(&self, server: &str, reply: &mut Value) {
        let mut masked = Vec::new();
        if let Some(result) = reply.get_mut("result") {
            mask_json_strings(result, &self.policy, &mut masked);
        }
        if let Some(data) = reply.get_mut("error").and_then(|e| e.get_mut("data")) {
            mask_json_strings(data, &self.policy, &mut masked);
        }

        for record in masked {
            let tokens = self.tokenizer.count_text(&record.original);
            if let Err(err) = self
                .store
                .put_masked_blob(
                    &record.content_hash,
                    tokens,
                    &record.preview,
                    json!(["mcp", server]),
                )
                .await
            {
                warn!(event = "masked_blob_write_failed", server, error = %err);
            }
        }
    }

    fn note_reachability(&self, server: &str, reachable: bool) {
        let mut guard = self
            .reachability
            .lock()
            .expect("reachability map poisoned");
        let previous = guard.insert(server.to_string(), reachable);
        if previous != Some(reachable) {
            info!(event = "mcp_server_status", server, reachable);
            self.hub.publish(Notice::McpServerStatus {
                server: server.to_string(),
                reachable,
            });
        }
    }
}

fn error_reply(kind: ErrorKind, request_id: &Value, message: String) -> GatewayReply {
    GatewayReply {
        status: kind.http_status(),
        body: json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "error": {
                "code": kind.jsonrpc_code(),
                "message": message,
            }
        }),
    }
}
