pub mod relay;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use kproxy_accounting::{Tokenizer, exceeds_context_limit, fold_totals, MetricTokens};
use kproxy_common::{ErrorKind, ProviderType, ProxyConfig, ProxyError};
use kproxy_protocol::convert::openai_to_gemini;
use kproxy_protocol::openai::ChatRequest;
use kproxy_storage::{MetricUsagePatch, NewMetric, NewRoutingDecision, Store};

use crate::compactor::{CompactionTrigger, Compactor};
use crate::hub::{Notice, ObserverHub};
use crate::routing::{RouteDecision, Router};
use crate::state::{SessionHandle, SessionRegistry};
use crate::upstream::{
    Headers, HttpMethod, StreamFault, TransportError, TransportErrorKind, UpstreamBody,
    UpstreamClient, UpstreamRequest, UpstreamResponse,
};

use relay::{RelayReport, StreamPhase, relay_stream};
use usage::{output_text_from_response_body, usage_from_response_body};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(4);

/// What the HTTP layer turns into a response.
pub enum ChatOutcome {
    /// Pre-dispatch failure: one OpenAI-compatible error JSON.
    Error(ProxyError),
    /// Buffered upstream reply (non-2xx forwarded verbatim, or a
    /// non-streaming success).
    Upstream {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
    /// Live SSE relay.
    Stream { rx: mpsc::Receiver<Bytes> },
}

pub struct ProxyEngine {
    config: Arc<ProxyConfig>,
    router: Arc<Router>,
    client: Arc<dyn UpstreamClient>,
    store: Arc<dyn Store>,
    hub: ObserverHub,
    tokenizer: Tokenizer,
    registry: Arc<SessionRegistry>,
    compactor: Arc<Compactor>,
}

impl ProxyEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ProxyConfig>,
        router: Arc<Router>,
        client: Arc<dyn UpstreamClient>,
        store: Arc<dyn Store>,
        hub: ObserverHub,
        tokenizer: Tokenizer,
        registry: Arc<SessionRegistry>,
        compactor: Arc<Compactor>,
    ) -> Self {
        Self {
            config,
            router,
            client,
            store,
            hub,
            tokenizer,
            registry,
            compactor,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub async fn handle_chat(&self, mut body: ChatRequest) -> ChatOutcome {
        let trace_id = uuid::Uuid::new_v4().to_string();
        let active = self.registry.active().await;
        let decision = match self.router.resolve(
            &body.model,
            active.as_ref().map(|s| s.provider_key.as_str()),
        ) {
            Ok(decision) => decision,
            Err(err) => return ChatOutcome::Error(err),
        };

        let session = match self
            .registry
            .ensure_session(&body.model, &decision.provider_key)
            .await
        {
            Ok(session) => session,
            Err(err) => return ChatOutcome::Error(err),
        };

        let estimate = self.tokenizer.count_messages(&body.messages);
        let features = &self.config.features;
        if features.context_precheck
            && session.context_precheck
            && exceeds_context_limit(estimate, session.max_context, features.precheck_ratio)
        {
            return ChatOutcome::Error(ProxyError::new(
                ErrorKind::ContextLimitExceeded,
                format!(
                    "request footprint {estimate} tokens is at or beyond {:.0}% of the {}-token window; compact the session, trim the history, or switch to a larger model",
                    features.precheck_ratio * 100.0,
                    session.max_context
                ),
            ));
        }

        self.registry.cache_history(session.id, &body.messages);

        let metric_id = match self
            .store
            .append_metric(NewMetric {
                session_id: session.id,
                estimated_input_tokens: estimate,
                source: "proxy".to_string(),
            })
            .await
        {
            Ok(id) => id,
            Err(err) => {
                return ChatOutcome::Error(ProxyError::new(
                    ErrorKind::StorageError,
                    err.to_string(),
                ));
            }
        };

        if let Err(err) = self
            .store
            .record_routing_decision(NewRoutingDecision {
                session_id: Some(session.id),
                client_model: body.model.clone(),
                provider_key: decision.provider_key.clone(),
                upstream_model: decision.upstream_model.clone(),
                base_url: decision.base_url.clone(),
            })
            .await
        {
            warn!(event = "routing_audit_failed", error = %err);
        }

        let is_stream = body.wants_stream();
        info!(
            event = "proxy_request",
            trace_id = %trace_id,
            session_id = session.id,
            provider = %decision.provider_key,
            model = %decision.upstream_model,
            is_stream = is_stream,
            estimated_input_tokens = estimate
        );
        let response = match self
            .dispatch_with_retries(&trace_id, &mut body, &decision, is_stream)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                self.settle_failed_dispatch(&session, metric_id, estimate, &err)
                    .await;
                return ChatOutcome::Error(err);
            }
        };

        let gemini = decision.provider_type == ProviderType::GeminiNative;
        if !(200..300).contains(&response.status) {
            return self
                .forward_error_verbatim(&session, metric_id, estimate, response)
                .await;
        }

        match response.body {
            UpstreamBody::Bytes(bytes) => {
                self.settle_buffered(&session, metric_id, estimate, gemini, &bytes)
                    .await;
                ChatOutcome::Upstream {
                    status: response.status,
                    headers: response.headers,
                    body: bytes,
                }
            }
            UpstreamBody::Stream(upstream_rx) => {
                let (tx, rx) = mpsc::channel(self.config.features.chunk_channel_capacity.max(1));
                let engine = self.clone_handles();
                let session = session.clone();
                tokio::spawn(async move {
                    let report = relay_stream(upstream_rx, tx, gemini).await;
                    engine.settle_stream(&session, metric_id, estimate, report).await;
                });
                ChatOutcome::Stream { rx }
            }
        }
    }

    /// Attempt loop. Retries happen only while no response exists at all, so
    /// no byte can ever be replayed downstream.
    async fn dispatch_with_retries(
        &self,
        trace_id: &str,
        body: &mut ChatRequest,
        decision: &RouteDecision,
        is_stream: bool,
    ) -> Result<UpstreamResponse, ProxyError> {
        let max_attempts = self.config.features.retry_attempts.max(1);
        let mut current = decision.clone();
        let mut request = build_upstream_request(body, &current, is_stream)?;
        let mut attempt: u32 = 0;
        let mut tried_same_on_5xx = false;
        let mut tried_fallback = false;

        loop {
            attempt += 1;
            info!(
                event = "upstream_attempt",
                trace_id = %trace_id,
                provider = %current.provider_key,
                model = %current.upstream_model,
                attempt = attempt,
                is_stream = is_stream
            );
            match self.client.send(request.clone()).await {
                // 5xx budget is its own: one same-provider retry, then one
                // fallback-provider retry when configured. No bytes have
                // been forwarded at this point, so both are safe.
                Ok(response) if (500..600).contains(&response.status) => {
                    if !tried_same_on_5xx {
                        tried_same_on_5xx = true;
                        tokio::time::sleep(backoff_delay(attempt)).await;
                        continue;
                    }
                    if !tried_fallback
                        && let Some(fallback_key) = current.fallback.clone()
                        && let Some(fallback) = self
                            .router
                            .resolve_fallback(&fallback_key, &decision.upstream_model)
                    {
                        info!(
                            event = "fallback_provider",
                            from = %current.provider_key,
                            to = %fallback.provider_key
                        );
                        tried_fallback = true;
                        request = build_upstream_request(body, &fallback, is_stream)?;
                        current = fallback;
                        tokio::time::sleep(backoff_delay(attempt)).await;
                        continue;
                    }
                    return Ok(response);
                }
                Ok(response) => return Ok(response),
                Err(err) => {
                    if attempt < max_attempts {
                        debug!(
                            event = "upstream_retry",
                            trace_id = %trace_id,
                            provider = %current.provider_key,
                            attempt = attempt,
                            error = %err.message
                        );
                        tokio::time::sleep(backoff_delay(attempt)).await;
                        continue;
                    }
                    return Err(transport_to_proxy_error(&err));
                }
            }
        }
    }

    async fn forward_error_verbatim(
        &self,
        session: &SessionHandle,
        metric_id: i64,
        estimate: i64,
        response: UpstreamResponse,
    ) -> ChatOutcome {
        let tag = if (500..600).contains(&response.status) {
            ErrorKind::UpstreamStatus5xx.tag()
        } else {
            ErrorKind::UpstreamStatus4xx.tag()
        };
        self.finish_metric_quietly(
            session,
            metric_id,
            estimate,
            MetricUsagePatch {
                prompt_tokens: None,
                completion_tokens: None,
                is_estimated: true,
                finish_reason: Some(tag.to_string()),
            },
        )
        .await;

        let body = match response.body {
            UpstreamBody::Bytes(bytes) => bytes,
            UpstreamBody::Stream(_) => Bytes::new(),
        };
        ChatOutcome::Upstream {
            status: response.status,
            headers: response.headers,
            body,
        }
    }

    async fn settle_failed_dispatch(
        &self,
        session: &SessionHandle,
        metric_id: i64,
        estimate: i64,
        err: &ProxyError,
    ) {
        self.finish_metric_quietly(
            session,
            metric_id,
            estimate,
            MetricUsagePatch {
                prompt_tokens: None,
                completion_tokens: None,
                is_estimated: true,
                finish_reason: Some(err.kind.tag().to_string()),
            },
        )
        .await;
    }

    async fn settle_buffered(
        &self,
        session: &SessionHandle,
        metric_id: i64,
        estimate: i64,
        gemini: bool,
        body: &Bytes,
    ) {
        let (usage, finish) = usage_from_response_body(body, gemini);
        let patch = if usage.is_complete() {
            MetricUsagePatch {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                is_estimated: false,
                finish_reason: Some(finish.unwrap_or_else(|| "stop".to_string())),
            }
        } else {
            let text = output_text_from_response_body(body, gemini);
            MetricUsagePatch {
                prompt_tokens: None,
                completion_tokens: Some(self.tokenizer.count_text(&text)),
                is_estimated: true,
                finish_reason: Some(finish.unwrap_or_else(|| "stop".to_string())),
            }
        };
        self.finish_metric_quietly(session, metric_id, estimate, patch)
            .await;
        self.after_commit(session).await;
    }

    async fn settle_stream(
        &self,
        session: &SessionHandle,
        metric_id: i64,
        estimate: i64,
        report: RelayReport,
    ) {
        let patch = match report.phase {
            StreamPhase::Closed if report.usage.is_complete() => MetricUsagePatch {
                prompt_tokens: report.usage.prompt_tokens,
                completion_tokens: report.usage.completion_tokens,
                is_estimated: false,
                finish_reason: Some(
                    report
                        .finish_reason
                        .clone()
                        .unwrap_or_else(|| "stop".to_string()),
                ),
            },
            StreamPhase::Aborted => MetricUsagePatch {
                prompt_tokens: None,
                completion_tokens: Some(self.tokenizer.count_text(&report.output_text)),
                is_estimated: true,
                finish_reason: Some(ErrorKind::ClientAbort.tag().to_string()),
            },
            StreamPhase::PartialAborted => {
                let error_kind = match report.fault {
                    Some(StreamFault::IdleTimeout) => ErrorKind::UpstreamTimeoutStream,
                    _ => ErrorKind::UpstreamReadError,
                };
                self.hub.publish(Notice::StreamingError {
                    session_id: Some(session.id),
                    error_type: error_kind.tag().to_string(),
                    message: "upstream stream ended before completion".to_string(),
                });
                MetricUsagePatch {
                    prompt_tokens: None,
                    completion_tokens: Some(self.tokenizer.count_text(&report.output_text)),
                    is_estimated: true,
                    finish_reason: Some(error_kind.tag().to_string()),
                }
            }
            _ => MetricUsagePatch {
                prompt_tokens: None,
                completion_tokens: Some(self.tokenizer.count_text(&report.output_text)),
                is_estimated: true,
                finish_reason: Some(
                    report
                        .finish_reason
                        .clone()
                        .unwrap_or_else(|| "stop".to_string()),
                ),
            },
        };

        self.finish_metric_quietly(session, metric_id, estimate, patch)
            .await;
        self.after_commit(session).await;
    }

    /// Commit the metric patch, then broadcast it. Commit order drives the
    /// observer's `metric` ordering for a session.
    async fn finish_metric_quietly(
        &self,
        session: &SessionHandle,
        metric_id: i64,
        estimate: i64,
        patch: MetricUsagePatch,
    ) {
        let commit_lock = self.registry.metric_commit_lock(session.id);
        let _ordered = commit_lock.lock().await;
        if let Err(err) = self.store.finish_metric(metric_id, patch.clone()).await {
            warn!(event = "metric_commit_failed", metric_id, error = %err);
            return;
        }
        self.hub.publish(Notice::Metric {
            session_id: session.id,
            metric_id,
            prompt_tokens: patch.prompt_tokens,
            completion_tokens: patch.completion_tokens,
            estimated_input_tokens: estimate,
            is_estimated: patch.is_estimated,
            finish_reason: patch.finish_reason,
        });
    }

    /// Post-commit bookkeeping: session totals, gauge update, compaction
    /// advisory and the automatic compaction trigger.
    async fn after_commit(&self, session: &SessionHandle) {
        let rows = match self.store.session_metrics(session.id).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(event = "totals_read_failed", session_id = session.id, error = %err);
                return;
            }
        };
        let tokens: Vec<MetricTokens> = rows
            .iter()
            .map(|row| MetricTokens {
                prompt_tokens: row.prompt_tokens,
                completion_tokens: row.completion_tokens,
                estimated_input_tokens: row.estimated_input_tokens,
            })
            .collect();
        let totals = fold_totals(tokens.iter());

        self.hub.publish(Notice::SessionUpdated {
            session_id: session.id,
            total_input: totals.total_input,
            total_output: totals.total_output,
            max_context: session.max_context,
        });

        let ratio = totals.total_input as f64 / session.max_context.max(1) as f64;
        if ratio < session.auto_compact_threshold {
            self.registry.reset_auto_compactions(session.id);
            return;
        }

        self.hub.publish(Notice::CompactionAlert {
            session_id: session.id,
            total_input: totals.total_input,
            max_context: session.max_context,
        });

        if !session.auto_compact {
            return;
        }
        match self.compactor.execute(session, CompactionTrigger::Auto).await {
            Ok(outcome) => {
                info!(
                    event = "auto_compaction",
                    session_id = session.id,
                    tokens_before = outcome.tokens_before,
                    tokens_after = outcome.tokens_after
                );
            }
            Err(err)
                if matches!(
                    err.kind,
                    ErrorKind::CompactionCooldown | ErrorKind::CompactionNoGain
                ) =>
            {
                debug!(event = "auto_compaction_skipped", session_id = session.id, reason = %err);
            }
            Err(err) => {
                warn!(event = "auto_compaction_failed", session_id = session.id, error = %err);
            }
        }
    }

    fn clone_handles(&self) -> ProxyEngine {
        ProxyEngine {
            config: self.config.clone(),
            router: self.router.clone(),
            client: self.client.clone(),
            store: self.store.clone(),
            hub: self.hub.clone(),
            tokenizer: self.tokenizer.clone(),
            registry: self.registry.clone(),
            compactor: self.compactor.clone(),
        }
    }
}

fn build_upstream_request(
    body: &mut ChatRequest,
    decision: &RouteDecision,
    is_stream: bool,
) -> Result<UpstreamRequest, ProxyError> {
    match decision.provider_type {
        ProviderType::GeminiNative => {
            let converted = openai_to_gemini(body);
            let payload = serde_json::to_vec(&converted).map_err(|err| {
                ProxyError::new(ErrorKind::UpstreamConnect, format!("encode body: {err}"))
            })?;
            let action = if is_stream {
                "streamGenerateContent"
            } else {
                "generateContent"
            };
            let mut url = format!(
                "{}/models/{}:{action}",
                decision.base_url, decision.upstream_model
            );
            if let Some(credential) = &decision.credential {
                url.push_str("?key=");
                url.push_str(credential);
            }
            Ok(UpstreamRequest {
                method: HttpMethod::Post,
                url,
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: Some(Bytes::from(payload)),
                is_stream,
                timeouts: decision.timeouts,
            })
        }
        _ => {
            body.model = decision.upstream_model.clone();
            body.force_include_usage();
            let payload = serde_json::to_vec(body).map_err(|err| {
                ProxyError::new(ErrorKind::UpstreamConnect, format!("encode body: {err}"))
            })?;
            let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
            if let Some(credential) = &decision.credential {
                headers.push(("authorization".to_string(), format!("Bearer {credential}")));
            }
            if is_stream {
                headers.push(("accept".to_string(), "text/event-stream".to_string()));
            }
            Ok(UpstreamRequest {
                method: HttpMethod::Post,
                url: format!("{}/chat/completions", decision.base_url),
                headers,
                body: Some(Bytes::from(payload)),
                is_stream,
                timeouts: decision.timeouts,
            })
        }
    }
}

fn transport_to_proxy_error(err: &TransportError) -> ProxyError {
    let kind = match err.kind {
        TransportErrorKind::Timeout => ErrorKind::UpstreamTimeoutHeaders,
        _ => ErrorKind::UpstreamConnect,
    };
    ProxyError::new(kind, err.message.clone())
}

/// Exponential backoff with full jitter: base 1 s doubling, capped at 4 s,
/// scaled by a uniform draw so synchronized retries spread out.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(8);
    let ceiling = BACKOFF_BASE
        .saturating_mul(1_u32 << exp)
        .min(BACKOFF_CAP);
    ceiling.mul_f64(rand::rng().random_range(0.0..=1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_under_cap() {
        for attempt in 1..10 {
            for _ in 0..32 {
                assert!(backoff_delay(attempt) <= BACKOFF_CAP);
            }
        }
    }

    #[test]
    fn gemini_request_selects_stream_action_and_query_key() {
        let mut body: ChatRequest = serde_json::from_value(serde_json::json!({
            "model": "alias/x",
            "stream": true,
            "messages": [{"role": "user", "content": "ping"}],
        }))
        .unwrap();
        let decision = RouteDecision {
            provider_key: "gem".to_string(),
            provider_type: ProviderType::GeminiNative,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            host_header: None,
            upstream_model: "gemini-pro".to_string(),
            credential: Some("k123".to_string()),
            timeouts: crate::upstream::TimeoutProfile {
                connect_secs: 10,
                request_secs: 120,
                stream_idle_secs: 60,
            },
            fallback: None,
            max_context: None,
        };
        let request = build_upstream_request(&mut body, &decision, true).unwrap();
        assert!(request.url.ends_with("/models/gemini-pro:streamGenerateContent?key=k123"));

        let request = build_upstream_request(&mut body, &decision, false).unwrap();
        assert!(request.url.contains(":generateContent"));
    }

    #[test]
    fn openai_request_swaps_model_and_injects_bearer() {
        let mut body: ChatRequest = serde_json::from_value(serde_json::json!({
            "model": "alias/x",
            "stream": true,
            "messages": [{"role": "user", "content": "ping"}],
        }))
        .unwrap();
        let decision = RouteDecision {
            provider_key: "nv".to_string(),
            provider_type: ProviderType::OpenaiCompatible,
            base_url: "http://fixture".to_string(),
            host_header: None,
            upstream_model: "real-x".to_string(),
            credential: Some("secret".to_string()),
            timeouts: crate::upstream::TimeoutProfile {
                connect_secs: 10,
                request_secs: 120,
                stream_idle_secs: 60,
            },
            fallback: None,
            max_context: None,
        };
        let request = build_upstream_request(&mut body, &decision, true).unwrap();
        assert_eq!(request.url, "http://fixture/chat/completions");
        let sent: serde_json::Value = serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
        assert_eq!(sent["model"], "real-x");
        assert_eq!(sent["stream_options"]["include_usage"], true);
        assert!(request
            .headers
            .iter()
            .any(|(k, v)| k == "authorization" && v == "Bearer secret"));
    }
}
