use std::convert::Infallible;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use kproxy_common::ProxyError;
use kproxy_core::ChatOutcome;
use kproxy_protocol::openai::ChatRequest;

use crate::AppState;

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/models", get(models_list))
        .route("/v1/models", get(models_list))
        .route("/health", get(health))
}

async fn chat_completions(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> Response {
    match state.engine.handle_chat(body).await {
        ChatOutcome::Error(err) => proxy_error_response(&err),
        ChatOutcome::Upstream {
            status,
            headers,
            body,
        } => {
            let mut builder = Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
            if let Some(out) = builder.headers_mut() {
                for (name, value) in headers {
                    if is_hop_by_hop_or_framing_header(&name) {
                        continue;
                    }
                    if let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(name.as_bytes()),
                        HeaderValue::from_str(&value),
                    ) {
                        out.append(name, value);
                    }
                }
            }
            builder.body(Body::from(body)).unwrap_or_else(|_| {
                (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response()
            })
        }
        ChatOutcome::Stream { rx } => {
            let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
            let mut builder = Response::builder().status(StatusCode::OK);
            if let Some(out) = builder.headers_mut() {
                out.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/event-stream"),
                );
                out.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
                out.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
                out.insert(
                    HeaderName::from_static("x-accel-buffering"),
                    HeaderValue::from_static("no"),
                );
            }
            builder
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| {
                    (StatusCode::INTERNAL_SERVER_ERROR, "response_build_failed").into_response()
                })
        }
    }
}

async fn models_list(State(state): State<AppState>) -> Response {
    Json(state.engine.router().models_list()).into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "providers": state.config.providers.len(),
        "models": state.config.models.len(),
    }))
    .into_response()
}

pub(crate) fn proxy_error_response(err: &ProxyError) -> Response {
    let status =
        StatusCode::from_u16(err.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.openai_body())).into_response()
}

fn is_hop_by_hop_or_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}
