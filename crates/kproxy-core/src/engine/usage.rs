use kproxy_protocol::gemini::GenerateContentResponse;
use kproxy_protocol::openai::{ChatChunk, ChatResponse, Usage};
use kproxy_protocol::sse::DONE_SENTINEL;

/// Usage figures distilled from a stream, authoritative when the provider
/// reported them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportedUsage {
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
}

impl ReportedUsage {
    pub fn is_complete(&self) -> bool {
        self.prompt_tokens.is_some() && self.completion_tokens.is_some()
    }
}

/// Accumulates usage and output text from OpenAI-shaped SSE payloads.
#[derive(Debug, Default)]
pub struct OpenAiStreamState {
    usage: ReportedUsage,
    output_text: String,
    finish_reason: Option<String>,
    saw_done: bool,
}

impl OpenAiStreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_payload(&mut self, data: &str) {
        if data == DONE_SENTINEL {
            self.saw_done = true;
            return;
        }
        let Ok(chunk) = serde_json::from_str::<ChatChunk>(data) else {
            return;
        };
        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                self.output_text.push_str(content);
            }
            if let Some(reason) = &choice.finish_reason {
                self.finish_reason = Some(reason.clone());
            }
        }
        if let Some(usage) = chunk.usage {
            self.absorb(usage);
        }
    }

    fn absorb(&mut self, usage: Usage) {
        if usage.prompt_tokens > 0 || usage.completion_tokens > 0 {
            self.usage.prompt_tokens = Some(usage.prompt_tokens);
            self.usage.completion_tokens = Some(usage.completion_tokens);
        }
    }

    pub fn usage(&self) -> ReportedUsage {
        self.usage
    }

    pub fn output_text(&self) -> &str {
        &self.output_text
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn saw_done(&self) -> bool {
        self.saw_done
    }
}

/// Accumulates usage and output text from Gemini stream payloads.
#[derive(Debug, Default)]
pub struct GeminiStreamState {
    usage: ReportedUsage,
    output_text: String,
    finish_reason: Option<String>,
}

impl GeminiStreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_payload(&mut self, data: &str) {
        let Ok(parsed) = serde_json::from_str::<GenerateContentResponse>(data) else {
            return;
        };
        for candidate in &parsed.candidates {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(text) = &part.text {
                        self.output_text.push_str(text);
                    }
                }
            }
            if let Some(reason) = &candidate.finish_reason {
                self.finish_reason = Some(reason.clone());
            }
        }
        if let Some(usage) = parsed.usage_metadata {
            if usage.prompt_token_count.is_some() || usage.candidates_token_count.is_some() {
                self.usage.prompt_tokens = usage.prompt_token_count;
                self.usage.completion_tokens = usage.candidates_token_count;
            }
        }
    }

    pub fn usage(&self) -> ReportedUsage {
        self.usage
    }

    pub fn output_text(&self) -> &str {
        &self.output_text
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }
}

/// Usage out of a non-streaming reply body.
pub fn usage_from_response_body(body: &[u8], gemini: bool) -> (ReportedUsage, Option<String>) {
    if gemini {
        let Ok(parsed) = serde_json::from_slice::<GenerateContentResponse>(body) else {
            return (ReportedUsage::default(), None);
        };
        let usage = parsed
            .usage_metadata
            .map(|u| ReportedUsage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
            })
            .unwrap_or_default();
        let finish = parsed
            .candidates
            .first()
            .and_then(|c| c.finish_reason.clone());
        return (usage, finish);
    }

    let Ok(parsed) = serde_json::from_slice::<ChatResponse>(body) else {
        return (ReportedUsage::default(), None);
    };
    let usage = parsed
        .usage
        .map(|u| ReportedUsage {
            prompt_tokens: Some(u.prompt_tokens),
            completion_tokens: Some(u.completion_tokens),
        })
        .unwrap_or_default();
    let finish = parsed
        .choices
        .first()
        .and_then(|c| c.finish_reason.clone());
    (usage, finish)
}

/// Assistant text out of a non-streaming reply, for counting completion
/// tokens when the provider reported no usage.
pub fn output_text_from_response_body(body: &[u8], gemini: bool) -> String {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return String::new();
    };
    if gemini {
        let mut out = String::new();
        if let Some(parts) = value
            .pointer("/candidates/0/content/parts")
            .and_then(|p| p.as_array())
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    out.push_str(text);
                }
            }
        }
        return out;
    }
    value
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_state_collects_deltas_then_usage() {
        let mut state = OpenAiStreamState::new();
        state.push_payload(r#"{"choices":[{"delta":{"content":"po"}}]}"#);
        state.push_payload(r#"{"choices":[{"delta":{"content":"ng"},"finish_reason":"stop"}]}"#);
        state.push_payload(r#"{"choices":[],"usage":{"prompt_tokens":4,"completion_tokens":2}}"#);
        state.push_payload(DONE_SENTINEL);

        assert_eq!(state.output_text(), "pong");
        assert_eq!(state.finish_reason(), Some("stop"));
        assert!(state.saw_done());
        assert_eq!(
            state.usage(),
            ReportedUsage {
                prompt_tokens: Some(4),
                completion_tokens: Some(2),
            }
        );
    }

    #[test]
    fn openai_state_survives_garbage() {
        let mut state = OpenAiStreamState::new();
        state.push_payload("not json at all");
        assert_eq!(state.usage(), ReportedUsage::default());
    }

    #[test]
    fn gemini_state_reads_usage_metadata() {
        let mut state = GeminiStreamState::new();
        state.push_payload(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"hi"}]},"finishReason":"STOP"}],
                "usageMetadata":{"promptTokenCount":7,"candidatesTokenCount":3}}"#,
        );
        assert_eq!(state.output_text(), "hi");
        assert_eq!(state.finish_reason(), Some("STOP"));
        assert_eq!(state.usage().prompt_tokens, Some(7));
        assert_eq!(state.usage().completion_tokens, Some(3));
    }

    #[test]
    fn nonstream_bodies_yield_usage() {
        let (usage, finish) = usage_from_response_body(
            br#"{"choices":[{"finish_reason":"stop"}],"usage":{"prompt_tokens":9,"completion_tokens":4,"total_tokens":13}}"#,
            false,
        );
        assert_eq!(usage.prompt_tokens, Some(9));
        assert_eq!(finish.as_deref(), Some("stop"));

        let (usage, _) = usage_from_response_body(
            br#"{"candidates":[],"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":1}}"#,
            true,
        );
        assert_eq!(usage.completion_tokens, Some(1));
    }
}
