use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use kproxy_accounting::{MetricTokens, fold_totals};

use crate::AppState;

pub(crate) fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(observer_ws))
}

async fn observer_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_observer(socket, state))
}

/// One observer connection: snapshot first, then event-driven until either
/// side goes away. Removal is implicit and idempotent; dropping the
/// broadcast receiver is the whole cleanup.
async fn handle_observer(mut socket: WebSocket, state: AppState) {
    let mut rx = state.hub.subscribe();
    let mut dropped: u64 = 0;

    if let Some(snapshot) = build_snapshot(&state).await {
        if socket.send(Message::Text(snapshot.into())).await.is_err() {
            return;
        }
    }

    loop {
        select! {
            incoming = socket.recv() => {
                // Observers only listen; any close or error ends the stream.
                if incoming.is_none() {
                    break;
                }
            }
            notice = rx.recv() => {
                match notice {
                    Ok(notice) => {
                        let Ok(text) = serde_json::to_string(&notice) else {
                            continue;
                        };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        dropped += skipped;
                        warn!(event = "observer_lagged", skipped, total_dropped = dropped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    debug!(event = "observer_disconnected", total_dropped = dropped);
}

/// Connect payload: the active session and the most recent metrics.
async fn build_snapshot(state: &AppState) -> Option<String> {
    let session = state.registry.active().await;
    let limit = state.config.features.snapshot_metrics as u64;
    let recent = state.store.recent_metrics(limit).await.ok()?;

    let totals = session.as_ref().map(|active| {
        let tokens: Vec<MetricTokens> = recent
            .iter()
            .filter(|row| row.session_id == active.id)
            .map(|row| MetricTokens {
                prompt_tokens: row.prompt_tokens,
                completion_tokens: row.completion_tokens,
                estimated_input_tokens: row.estimated_input_tokens,
            })
            .collect();
        fold_totals(tokens.iter())
    });

    let payload = serde_json::json!({
        "type": "snapshot",
        "session": session.as_ref().map(|s| serde_json::json!({
            "id": s.id,
            "name": s.name,
            "provider": s.provider_key,
            "model": s.model_key,
            "max_context": s.max_context,
            "auto_compact": s.auto_compact,
        })),
        "recent_input": totals.map(|t| t.total_input),
        "recent_output": totals.map(|t| t.total_output),
        "metrics": recent.iter().map(|row| serde_json::json!({
            "id": row.id,
            "session_id": row.session_id,
            "prompt_tokens": row.prompt_tokens,
            "completion_tokens": row.completion_tokens,
            "estimated_input_tokens": row.estimated_input_tokens,
            "is_estimated": row.is_estimated,
            "finish_reason": row.finish_reason,
        })).collect::<Vec<_>>(),
    });
    serde_json::to_string(&payload).ok()
}
