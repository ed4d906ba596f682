use serde::Serialize;
use tokio::sync::broadcast;

/// Envelope pushed to every observer. The `type` discriminator is the closed
/// set the dashboard dispatches on; adding a variant is a wire change.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    Metric {
        session_id: i64,
        metric_id: i64,
        prompt_tokens: Option<i64>,
        completion_tokens: Option<i64>,
        estimated_input_tokens: i64,
        is_estimated: bool,
        finish_reason: Option<String>,
    },
    SessionCreated {
        session_id: i64,
        name: String,
        provider_key: String,
        model_key: Option<String>,
        max_context: i64,
    },
    SessionUpdated {
        session_id: i64,
        total_input: i64,
        total_output: i64,
        max_context: i64,
    },
    StreamingError {
        session_id: Option<i64>,
        error_type: String,
        message: String,
    },
    CompactionAlert {
        session_id: i64,
        total_input: i64,
        max_context: i64,
    },
    CompactionDone {
        session_id: i64,
        tokens_before: i64,
        tokens_after: i64,
        messages_kept: i32,
        messages_dropped: i32,
    },
    AutoSessionToggled {
        enabled: bool,
    },
    MemoryUpdated {
        session_id: i64,
        entry_id: i64,
        kind: String,
    },
    McpServerStatus {
        server: String,
        reachable: bool,
    },
}

/// Best-effort fan-out. Producers publish into a broadcast ring sized by the
/// configured queue depth and never block; an observer that falls behind
/// loses the oldest messages and learns the exact skip count from
/// `RecvError::Lagged`, which the socket loop folds into its drop counter.
#[derive(Clone)]
pub struct ObserverHub {
    tx: broadcast::Sender<Notice>,
}

impl ObserverHub {
    pub fn new(queue_depth: usize) -> Self {
        let (tx, _) = broadcast::channel(queue_depth.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    /// Non-blocking send. A hub with no observers swallows the notice.
    pub fn publish(&self, notice: Notice) {
        let _ = self.tx.send(notice);
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_discriminator_is_snake_case() {
        let notice = Notice::StreamingError {
            session_id: Some(3),
            error_type: "upstream_read_error".to_string(),
            message: "reset".to_string(),
        };
        let value = serde_json::to_value(&notice).unwrap();
        assert_eq!(value["type"], "streaming_error");
        assert_eq!(value["error_type"], "upstream_read_error");
    }

    #[test]
    fn publish_without_observers_is_a_no_op() {
        let hub = ObserverHub::new(8);
        hub.publish(Notice::AutoSessionToggled { enabled: true });
        assert_eq!(hub.observer_count(), 0);
    }
}
