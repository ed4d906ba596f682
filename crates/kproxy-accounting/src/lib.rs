use std::sync::Arc;

use tiktoken_rs::{CoreBPE, cl100k_base};

use kproxy_common::{ModelConfig, ProxyConfig};
use kproxy_protocol::openai::ChatMessage;

/// Fixed per-message framing overhead added to the serialized content count.
pub const MESSAGE_OVERHEAD_TOKENS: i64 = 4;

/// Process-wide byte-pair tokenizer (cl100k_base vocabulary). Built once at
/// startup and shared by reference; encoding state is immutable.
#[derive(Clone)]
pub struct Tokenizer {
    bpe: Arc<CoreBPE>,
}

impl Tokenizer {
    pub fn cl100k() -> Result<Self, String> {
        let bpe = cl100k_base().map_err(|err| err.to_string())?;
        Ok(Self { bpe: Arc::new(bpe) })
    }

    pub fn count_text(&self, text: &str) -> i64 {
        self.bpe.encode_ordinary(text).len() as i64
    }

    /// Token footprint of a message array: per-message serialized textual
    /// content plus the framing overhead.
    pub fn count_messages(&self, messages: &[ChatMessage]) -> i64 {
        messages
            .iter()
            .map(|message| self.count_text(&message.text_content()) + MESSAGE_OVERHEAD_TOKENS)
            .sum()
    }

    /// Per-message counts, in order. The compactor plans against these.
    pub fn message_counts(&self, messages: &[ChatMessage]) -> Vec<i64> {
        messages
            .iter()
            .map(|message| self.count_text(&message.text_content()) + MESSAGE_OVERHEAD_TOKENS)
            .collect()
    }
}

/// Whether a request footprint crosses the admission ceiling.
/// The boundary is inclusive: exactly `ratio · max_context` is rejected.
pub fn exceeds_context_limit(footprint: i64, max_context: i64, ratio: f64) -> bool {
    let ceiling = (max_context as f64 * ratio).ceil() as i64;
    footprint >= ceiling
}

/// Max-context for a session. An explicit model wins; a provider-only
/// session uses the minimum across that provider's models so the gauge never
/// promises a window the current model cannot honor.
pub fn resolve_max_context(
    config: &ProxyConfig,
    model_key: Option<&str>,
    provider_key: &str,
) -> Option<i64> {
    if let Some(key) = model_key {
        if let Some(model) = config.models.get(key) {
            return Some(model.max_context);
        }
    }
    config
        .models
        .values()
        .filter(|model| model.provider == provider_key)
        .map(|model: &ModelConfig| model.max_context)
        .min()
}

/// Running totals for one session, folded over its metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionTotals {
    pub total_input: i64,
    pub total_output: i64,
    pub requests: i64,
}

/// The fields of a metric row the fold needs.
#[derive(Debug, Clone, Copy)]
pub struct MetricTokens {
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub estimated_input_tokens: i64,
}

pub fn fold_totals<'a>(metrics: impl IntoIterator<Item = &'a MetricTokens>) -> SessionTotals {
    let mut totals = SessionTotals::default();
    for metric in metrics {
        totals.total_input += metric
            .prompt_tokens
            .unwrap_or(metric.estimated_input_tokens);
        totals.total_output += metric.completion_tokens.unwrap_or(0);
        totals.requests += 1;
    }
    totals
}
