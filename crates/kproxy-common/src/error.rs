use serde_json::json;

/// Closed error taxonomy. Every kind carries a stable machine-readable tag;
/// the HTTP status is derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigError,
    UnknownModel,
    LoopDetected,
    ContextLimitExceeded,
    UpstreamConnect,
    UpstreamTimeoutHeaders,
    UpstreamTimeoutStream,
    UpstreamReadError,
    UpstreamStatus4xx,
    UpstreamStatus5xx,
    ClientAbort,
    CompactionCooldown,
    CompactionNoGain,
    McpUnknownServer,
    McpUpstreamUnreachable,
    McpInvalidUpstreamJson,
    McpInternal,
    StorageError,
}

impl ErrorKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ErrorKind::ConfigError => "config_error",
            ErrorKind::UnknownModel => "unknown_model",
            ErrorKind::LoopDetected => "loop_detected",
            ErrorKind::ContextLimitExceeded => "context_limit_exceeded",
            ErrorKind::UpstreamConnect => "upstream_connect",
            ErrorKind::UpstreamTimeoutHeaders => "upstream_timeout_headers",
            ErrorKind::UpstreamTimeoutStream => "upstream_timeout_stream",
            ErrorKind::UpstreamReadError => "upstream_read_error",
            ErrorKind::UpstreamStatus4xx => "upstream_status_4xx",
            ErrorKind::UpstreamStatus5xx => "upstream_status_5xx",
            ErrorKind::ClientAbort => "client_abort",
            ErrorKind::CompactionCooldown => "compaction_cooldown",
            ErrorKind::CompactionNoGain => "compaction_no_gain",
            ErrorKind::McpUnknownServer => "mcp_gateway_unknown_server",
            ErrorKind::McpUpstreamUnreachable => "mcp_gateway_unreachable",
            ErrorKind::McpInvalidUpstreamJson => "mcp_gateway_invalid_json",
            ErrorKind::McpInternal => "mcp_gateway_internal",
            ErrorKind::StorageError => "storage_error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::ConfigError => 500,
            ErrorKind::UnknownModel => 404,
            ErrorKind::LoopDetected => 500,
            ErrorKind::ContextLimitExceeded => 400,
            ErrorKind::UpstreamConnect => 502,
            ErrorKind::UpstreamTimeoutHeaders => 504,
            ErrorKind::UpstreamTimeoutStream => 502,
            ErrorKind::UpstreamReadError => 502,
            ErrorKind::UpstreamStatus4xx => 400,
            ErrorKind::UpstreamStatus5xx => 502,
            ErrorKind::ClientAbort => 499,
            ErrorKind::CompactionCooldown => 409,
            ErrorKind::CompactionNoGain => 409,
            ErrorKind::McpUnknownServer => 404,
            ErrorKind::McpUpstreamUnreachable => 502,
            ErrorKind::McpInvalidUpstreamJson => 502,
            ErrorKind::McpInternal => 502,
            ErrorKind::StorageError => 500,
        }
    }

    /// JSON-RPC error code for gateway kinds; internal error otherwise.
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            ErrorKind::McpUnknownServer => -32001,
            ErrorKind::McpUpstreamUnreachable => -32002,
            ErrorKind::McpInvalidUpstreamJson => -32003,
            _ => -32603,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {message}", kind.tag())]
pub struct ProxyError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProxyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// OpenAI-compatible error envelope, used on the proxy surface.
    pub fn openai_body(&self) -> serde_json::Value {
        json!({
            "error": {
                "type": self.kind.tag(),
                "message": self.message,
                "code": self.kind.tag(),
            }
        })
    }

    /// Terse envelope used by the management surface.
    pub fn api_body(&self) -> serde_json::Value {
        json!({ "error": self.kind.tag(), "detail": self.message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_stable() {
        assert_eq!(ErrorKind::ContextLimitExceeded.tag(), "context_limit_exceeded");
        assert_eq!(ErrorKind::LoopDetected.http_status(), 500);
        assert_eq!(ErrorKind::UpstreamTimeoutHeaders.http_status(), 504);
    }

    #[test]
    fn jsonrpc_codes_match_gateway_contract() {
        assert_eq!(ErrorKind::McpUnknownServer.jsonrpc_code(), -32001);
        assert_eq!(ErrorKind::McpUpstreamUnreachable.jsonrpc_code(), -32002);
        assert_eq!(ErrorKind::McpInvalidUpstreamJson.jsonrpc_code(), -32003);
        assert_eq!(ErrorKind::McpInternal.jsonrpc_code(), -32603);
        assert_eq!(ErrorKind::StorageError.jsonrpc_code(), -32603);
    }

    #[test]
    fn openai_body_shape() {
        let err = ProxyError::new(ErrorKind::UnknownModel, "no such model");
        let body = err.openai_body();
        assert_eq!(body["error"]["type"], "unknown_model");
        assert_eq!(body["error"]["message"], "no such model");
    }
}
