use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Inbound chat-completion body. Only the fields the proxy inspects are
/// typed; everything else rides along in `extra` so the on-the-wire body
/// survives the round trip untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatRequest {
    pub fn wants_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Streaming OpenAI-family upstreams only report usage when asked.
    pub fn force_include_usage(&mut self) {
        if !self.wants_stream() {
            return;
        }
        let opts = self.stream_options.get_or_insert_with(StreamOptions::default);
        if opts.include_usage.is_none() {
            opts.include_usage = Some(true);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_usage: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Value::String(content.to_string()),
            extra: Map::new(),
        }
    }

    /// The textual payload of the message, whatever shape the content takes.
    /// Multimodal parts contribute their `text` fields; binary parts count
    /// for nothing here but are still forwarded upstream.
    pub fn text_content(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            Value::Array(parts) => {
                let mut joined = String::new();
                for part in parts {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        if !joined.is_empty() {
                            joined.push('\n');
                        }
                        joined.push_str(text);
                    }
                }
                joined
            }
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

/// One streamed chunk. `choices` may be empty on the terminal usage event.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
}

/// Non-streaming completion reply, read only for usage and finish reason.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<ResponseChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseChoice {
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub owned_by: String,
    pub root: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

impl ModelList {
    pub fn new(data: Vec<ModelEntry>) -> Self {
        Self {
            object: "list",
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_fields_round_trip() {
        let body = serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi", "name": "n"}],
            "tools": [{"type": "function"}],
            "seed": 7,
        });
        let req: ChatRequest = serde_json::from_value(body.clone()).unwrap();
        assert_eq!(req.extra.get("seed"), Some(&Value::from(7)));
        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back.get("tools"), body.get("tools"));
        assert_eq!(
            back["messages"][0].get("name").and_then(|v| v.as_str()),
            Some("n")
        );
    }

    #[test]
    fn text_content_handles_parts() {
        let msg: ChatMessage = serde_json::from_value(serde_json::json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "see this"},
                {"type": "image_url", "image_url": {"url": "data:..."}},
                {"type": "text", "text": "and that"},
            ],
        }))
        .unwrap();
        assert_eq!(msg.text_content(), "see this\nand that");
    }

    #[test]
    fn include_usage_is_forced_only_for_streams() {
        let mut req: ChatRequest = serde_json::from_value(serde_json::json!({
            "model": "m", "messages": [], "stream": true,
        }))
        .unwrap();
        req.force_include_usage();
        assert_eq!(
            req.stream_options.as_ref().and_then(|o| o.include_usage),
            Some(true)
        );

        let mut plain: ChatRequest =
            serde_json::from_value(serde_json::json!({"model": "m", "messages": []})).unwrap();
        plain.force_include_usage();
        assert!(plain.stream_options.is_none());
    }
}
