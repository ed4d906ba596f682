use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::Json;
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use kproxy_accounting::{MetricTokens, fold_totals};
use kproxy_common::{ErrorKind, ProxyError};
use kproxy_core::compactor::CompactionTrigger;
use kproxy_core::hub::Notice;
use kproxy_core::sanitize::sha256_hex;
use kproxy_core::state::{SessionHandle, SessionSpec};
use kproxy_storage::entities::{metrics, sessions};
use kproxy_storage::{NewMemory, StoreError};

use crate::AppState;

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/{id}", axum::routing::delete(delete_session))
        .route("/api/sessions/{id}/select", post(select_session))
        .route("/api/sessions/{id}/metrics", get(session_metrics))
        .route("/api/sessions/{id}/export", get(export_session))
        .route(
            "/api/sessions/{id}/auto-compact",
            get(get_auto_compact).put(put_auto_compact),
        )
        .route("/api/sessions/{id}/compaction/preview", get(compaction_preview))
        .route("/api/sessions/{id}/compaction", post(compaction_execute))
        .route("/api/sessions/{id}/history", get(session_history))
        .route("/api/metrics/log", post(absorb_log_metric))
        .route("/api/auto-session", get(get_auto_session).post(toggle_auto_session))
        .route("/api/blobs", post(store_blob))
        .route("/api/blobs/{hash}", get(fetch_blob))
        .route("/api/memory", get(fetch_memories).post(store_memory))
        .route("/api/mcp/servers", get(list_mcp_servers))
        .route("/api/mcp-gateway/{server}/rpc", post(mcp_gateway_rpc))
}

fn api_error(err: ProxyError) -> Response {
    let status =
        StatusCode::from_u16(err.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.api_body())).into_response()
}

fn storage_error(err: StoreError) -> Response {
    api_error(ProxyError::new(ErrorKind::StorageError, err.to_string()))
}

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": format!("{what}_not_found") })),
    )
        .into_response()
}

fn format_time(value: OffsetDateTime) -> String {
    value
        .format(&Rfc3339)
        .unwrap_or_else(|_| value.unix_timestamp().to_string())
}

fn session_json(row: &sessions::Model) -> serde_json::Value {
    serde_json::json!({
        "id": row.id,
        "name": row.name,
        "provider": row.provider_key,
        "model": row.model_key,
        "max_context": row.max_context,
        "reserved_tokens": row.reserved_tokens,
        "auto_compact": row.auto_compact,
        "auto_compact_threshold": row.auto_compact_threshold,
        "active": row.active,
        "created_at": format_time(row.created_at),
    })
}

fn metric_json(row: &metrics::Model) -> serde_json::Value {
    serde_json::json!({
        "id": row.id,
        "session_id": row.session_id,
        "at": format_time(row.at),
        "prompt_tokens": row.prompt_tokens,
        "completion_tokens": row.completion_tokens,
        "estimated_input_tokens": row.estimated_input_tokens,
        "is_estimated": row.is_estimated,
        "source": row.source,
        "finish_reason": row.finish_reason,
    })
}

// ---- Sessions ----

async fn list_sessions(State(state): State<AppState>) -> Response {
    let rows = match state.store.list_sessions().await {
        Ok(rows) => rows,
        Err(err) => return storage_error(err),
    };
    let sessions: Vec<_> = rows.iter().map(session_json).collect();
    Json(serde_json::json!({ "sessions": sessions })).into_response()
}

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    #[serde(default)]
    name: Option<String>,
    provider: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    reserved_tokens: i64,
    #[serde(default)]
    auto_compact: Option<bool>,
    #[serde(default)]
    auto_compact_threshold: Option<f64>,
    #[serde(default)]
    context_precheck: Option<bool>,
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Response {
    let name = body.name.unwrap_or_else(|| {
        body.model
            .clone()
            .unwrap_or_else(|| body.provider.clone())
    });
    match state
        .registry
        .create_session(SessionSpec {
            name,
            provider_key: body.provider,
            model_key: body.model,
            reserved_tokens: body.reserved_tokens,
            auto_compact: body.auto_compact,
            auto_compact_threshold: body.auto_compact_threshold,
            context_precheck: body.context_precheck,
        })
        .await
    {
        Ok(handle) => (
            StatusCode::OK,
            Json(serde_json::json!({ "id": handle.id, "max_context": handle.max_context })),
        )
            .into_response(),
        Err(err) => api_error(err),
    }
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.store.soft_delete_session(id).await {
        Ok(()) => Json(serde_json::json!({ "id": id, "deleted": true })).into_response(),
        Err(StoreError::NotFound(_)) => not_found("session"),
        Err(err) => storage_error(err),
    }
}

async fn select_session(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.registry.select_session(id).await {
        Ok(handle) => Json(serde_json::json!({ "id": handle.id, "active": true })).into_response(),
        Err(err) => api_error(err),
    }
}

async fn session_metrics(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let rows = match state.store.session_metrics(id).await {
        Ok(rows) => rows,
        Err(err) => return storage_error(err),
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
    let metrics: Vec<_> = rows.iter().map(metric_json).collect();
    Json(serde_json::json!({
        "metrics": metrics,
        "total_input": totals.total_input,
        "total_output": totals.total_output,
        "requests": totals.requests,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    #[serde(default)]
    format: Option<String>,
}

async fn export_session(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<ExportQuery>,
) -> Response {
    let rows = match state.store.session_metrics(id).await {
        Ok(rows) => rows,
        Err(err) => return storage_error(err),
    };

    match query.format.as_deref().unwrap_or("json") {
        "csv" => {
            let mut out = String::from(
                "id,at,prompt_tokens,completion_tokens,estimated_input_tokens,is_estimated,source,finish_reason\n",
            );
            for row in &rows {
                out.push_str(&format!(
                    "{},{},{},{},{},{},{},{}\n",
                    row.id,
                    format_time(row.at),
                    row.prompt_tokens.map_or(String::new(), |v| v.to_string()),
                    row.completion_tokens
                        .map_or(String::new(), |v| v.to_string()),
                    row.estimated_input_tokens,
                    row.is_estimated,
                    row.source,
                    row.finish_reason.as_deref().unwrap_or(""),
                ));
            }
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
                out,
            )
                .into_response()
        }
        "json" => {
            let metrics: Vec<_> = rows.iter().map(metric_json).collect();
            Json(serde_json::json!({ "session_id": id, "metrics": metrics })).into_response()
        }
        other => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "invalid_format",
                "detail": format!("unsupported export format: {other}"),
            })),
        )
            .into_response(),
    }
}

async fn get_auto_compact(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.store.session(id).await {
        Ok(Some(row)) => Json(serde_json::json!({
            "enabled": row.auto_compact,
            "threshold": row.auto_compact_threshold,
        }))
        .into_response(),
        Ok(None) => not_found("session"),
        Err(err) => storage_error(err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct AutoCompactBody {
    /// Absent means "toggle".
    #[serde(default)]
    enabled: Option<bool>,
}

async fn put_auto_compact(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Bytes,
) -> Response {
    let requested = serde_json::from_slice::<AutoCompactBody>(&body)
        .unwrap_or_default()
        .enabled;
    let target = match requested {
        Some(value) => value,
        None => match state.store.session(id).await {
            Ok(Some(row)) => !row.auto_compact,
            Ok(None) => return not_found("session"),
            Err(err) => return storage_error(err),
        },
    };

    match state.store.set_auto_compact(id, target).await {
        Ok(enabled) => {
            state.registry.patch_active_auto_compact(id, enabled).await;
            Json(serde_json::json!({ "enabled": enabled })).into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn session_handle(state: &AppState, id: i64) -> Result<SessionHandle, Response> {
    match state.store.session(id).await {
        Ok(Some(row)) => Ok(SessionHandle::from(row)),
        Ok(None) => Err(not_found("session")),
        Err(err) => Err(storage_error(err)),
    }
}

async fn compaction_preview(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let handle = match session_handle(&state, id).await {
        Ok(handle) => handle,
        Err(resp) => return resp,
    };
    match state.compactor.preview(&handle) {
        Ok(preview) => Json(preview).into_response(),
        Err(err) => api_error(err),
    }
}

async fn compaction_execute(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let handle = match session_handle(&state, id).await {
        Ok(handle) => handle,
        Err(resp) => return resp,
    };
    match state
        .compactor
        .execute(&handle, CompactionTrigger::Manual)
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => api_error(err),
    }
}

async fn session_history(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.registry.history(id) {
        Some(messages) => Json(serde_json::json!({ "messages": messages })).into_response(),
        None => Json(serde_json::json!({ "messages": [] })).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct LogMetricBody {
    session_id: i64,
    /// RFC 3339; defaults to now.
    #[serde(default)]
    at: Option<String>,
    prompt_tokens: i64,
    completion_tokens: i64,
}

/// Ingest point for the external log watcher. Proxy-side metrics always
/// shadow log-derived ones for the same instant.
async fn absorb_log_metric(
    State(state): State<AppState>,
    Json(body): Json<LogMetricBody>,
) -> Response {
    let at = match body.at.as_deref() {
        Some(raw) => match OffsetDateTime::parse(raw, &Rfc3339) {
            Ok(at) => at,
            Err(err) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": "invalid_at", "detail": err.to_string() })),
                )
                    .into_response();
            }
        },
        None => OffsetDateTime::now_utc(),
    };

    match state
        .store
        .absorb_log_metric(body.session_id, at, body.prompt_tokens, body.completion_tokens)
        .await
    {
        Ok(Some(id)) => Json(serde_json::json!({ "id": id, "absorbed": true })).into_response(),
        Ok(None) => Json(serde_json::json!({ "absorbed": false })).into_response(),
        Err(err) => storage_error(err),
    }
}

// ---- Auto-session ----

async fn get_auto_session(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({ "enabled": state.registry.auto_session_enabled() })).into_response()
}

async fn toggle_auto_session(State(state): State<AppState>) -> Response {
    let enabled = state.registry.toggle_auto_session();
    Json(serde_json::json!({ "enabled": enabled })).into_response()
}

// ---- Masked blobs ----

#[derive(Debug, Deserialize)]
struct StoreBlobBody {
    content: String,
    #[serde(default)]
    tags: Vec<String>,
}

async fn store_blob(State(state): State<AppState>, Json(body): Json<StoreBlobBody>) -> Response {
    let hash = sha256_hex(body.content.as_bytes());
    let tokens = state.tokenizer.count_text(&body.content);
    let preview: String = body.content.chars().take(120).collect();
    match state
        .store
        .put_masked_blob(&hash, tokens, &preview, serde_json::json!(body.tags))
        .await
    {
        Ok(()) => Json(serde_json::json!({ "content_hash": hash, "original_tokens": tokens }))
            .into_response(),
        Err(err) => storage_error(err),
    }
}

async fn fetch_blob(State(state): State<AppState>, Path(hash): Path<String>) -> Response {
    match state.store.masked_blob(&hash).await {
        Ok(Some(row)) => Json(serde_json::json!({
            "content_hash": row.content_hash,
            "original_tokens": row.original_tokens,
            "preview": row.preview,
            "tags": row.tags,
            "created_at": format_time(row.created_at),
        }))
        .into_response(),
        Ok(None) => not_found("blob"),
        Err(err) => storage_error(err),
    }
}

// ---- Memory ----

#[derive(Debug, Deserialize)]
struct MemoryQuery {
    session_id: i64,
}

async fn fetch_memories(
    State(state): State<AppState>,
    Query(query): Query<MemoryQuery>,
) -> Response {
    let threshold = state.config.features.memory_promote_threshold;
    match state
        .store
        .fetch_memories(query.session_id, threshold)
        .await
    {
        Ok(rows) => {
            let entries: Vec<_> = rows
                .iter()
                .map(|row| {
                    serde_json::json!({
                        "id": row.id,
                        "session_id": row.session_id,
                        "kind": row.kind,
                        "content": row.content,
                        "token_count": row.token_count,
                        "access_count": row.access_count,
                        "created_at": format_time(row.created_at),
                        "last_accessed_at": format_time(row.last_accessed_at),
                    })
                })
                .collect();
            Json(serde_json::json!({ "entries": entries })).into_response()
        }
        Err(err) => storage_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct StoreMemoryBody {
    session_id: i64,
    kind: String,
    content: String,
}

async fn store_memory(
    State(state): State<AppState>,
    Json(body): Json<StoreMemoryBody>,
) -> Response {
    if !matches!(body.kind.as_str(), "frequent" | "episodic" | "semantic") {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "invalid_memory_kind",
                "detail": "kind must be frequent, episodic or semantic",
            })),
        )
            .into_response();
    }

    let token_count = state.tokenizer.count_text(&body.content);
    match state
        .store
        .put_memory(NewMemory {
            session_id: body.session_id,
            kind: body.kind.clone(),
            content: body.content,
            token_count,
        })
        .await
    {
        Ok(id) => {
            state.hub.publish(Notice::MemoryUpdated {
                session_id: body.session_id,
                entry_id: id,
                kind: body.kind,
            });
            Json(serde_json::json!({ "id": id, "token_count": token_count })).into_response()
        }
        Err(err) => storage_error(err),
    }
}

// ---- MCP ----

async fn list_mcp_servers(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({ "servers": state.gateway.server_names() })).into_response()
}

async fn mcp_gateway_rpc(
    State(state): State<AppState>,
    Path(server): Path<String>,
    body: Bytes,
) -> Response {
    let reply = state.gateway.forward(&server, body).await;
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(reply.body)).into_response()
}
