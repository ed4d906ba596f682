use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};

use kproxy_accounting::Tokenizer;
use kproxy_common::{ErrorKind, FeatureConfig, ProxyError};
use kproxy_protocol::openai::ChatMessage;
use kproxy_storage::{NewCompaction, Store};

use crate::hub::{Notice, ObserverHub};
use crate::routing::RouteDecision;
use crate::state::{SessionHandle, SessionRegistry};
use crate::upstream::{HttpMethod, UpstreamBody, UpstreamClient, UpstreamRequest};

#[derive(Debug, Clone, Copy)]
pub struct CompactionPolicy {
    pub keep_recent: usize,
    pub target_ratio: f64,
    pub min_gain: f64,
    pub cooldown: Duration,
    pub max_consecutive: u32,
}

impl CompactionPolicy {
    pub fn from_features(features: &FeatureConfig) -> Self {
        Self {
            keep_recent: features.compact_keep_pairs,
            target_ratio: features.compact_target_ratio,
            min_gain: features.compact_min_gain,
            cooldown: Duration::from_secs(features.compact_cooldown_secs),
            max_consecutive: features.compact_max_consecutive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionTrigger {
    Manual,
    Auto,
}

/// Which message indices survive and which get replaced by the summary.
#[derive(Debug, Clone)]
pub struct CompactionPlan {
    pub tokens_before: i64,
    pub kept: Vec<usize>,
    pub dropped: Vec<usize>,
    pub dropped_tokens: i64,
}

/// Split indices: every system message survives, the last `keep_recent`
/// non-system messages survive, and the middle is filled newest-first until
/// the kept footprint reaches `target_ratio · (max_context − reserved)`.
pub fn plan_compaction(
    messages: &[ChatMessage],
    counts: &[i64],
    max_context: i64,
    reserved_tokens: i64,
    policy: &CompactionPolicy,
) -> CompactionPlan {
    debug_assert_eq!(messages.len(), counts.len());
    let tokens_before: i64 = counts.iter().sum();

    let system: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == "system")
        .map(|(i, _)| i)
        .collect();
    let conversational: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role != "system")
        .map(|(i, _)| i)
        .collect();

    let recent_start = conversational.len().saturating_sub(policy.keep_recent);
    let recent: Vec<usize> = conversational[recent_start..].to_vec();
    let middle: Vec<usize> = conversational[..recent_start].to_vec();

    let ceiling = (max_context - reserved_tokens).max(0);
    let budget = (ceiling as f64 * policy.target_ratio) as i64;

    let mut accumulated: i64 = system.iter().map(|&i| counts[i]).sum::<i64>()
        + recent.iter().map(|&i| counts[i]).sum::<i64>();

    let mut kept_middle: Vec<usize> = Vec::new();
    let mut dropped: Vec<usize> = Vec::new();
    let mut selecting = accumulated < budget;
    for &idx in middle.iter().rev() {
        if selecting {
            kept_middle.push(idx);
            accumulated += counts[idx];
            if accumulated >= budget {
                selecting = false;
            }
        } else {
            dropped.push(idx);
        }
    }
    dropped.reverse();

    let mut kept: Vec<usize> = system
        .into_iter()
        .chain(kept_middle)
        .chain(recent)
        .collect();
    kept.sort_unstable();

    let dropped_tokens = dropped.iter().map(|&i| counts[i]).sum();
    CompactionPlan {
        tokens_before,
        kept,
        dropped,
        dropped_tokens,
    }
}

/// Produces the synthetic summary for a dropped prefix. The real
/// implementation calls an external model; the placeholder names what was
/// elided.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, dropped: &[ChatMessage]) -> Option<String>;
}

pub struct PlaceholderSummarizer;

#[async_trait]
impl Summarizer for PlaceholderSummarizer {
    async fn summarize(&self, _dropped: &[ChatMessage]) -> Option<String> {
        None
    }
}

/// Summarizes by calling a configured upstream chat model.
pub struct ChatSummarizer {
    client: Arc<dyn UpstreamClient>,
    route: RouteDecision,
}

impl ChatSummarizer {
    pub fn new(client: Arc<dyn UpstreamClient>, route: RouteDecision) -> Self {
        Self { client, route }
    }
}

#[derive(Serialize)]
struct SummaryRequestBody<'a> {
    model: &'a str,
    messages: Vec<serde_json::Value>,
    stream: bool,
}

#[async_trait]
impl Summarizer for ChatSummarizer {
    async fn summarize(&self, dropped: &[ChatMessage]) -> Option<String> {
        let mut transcript = String::new();
        for message in dropped {
            transcript.push_str(&message.role);
            transcript.push_str(": ");
            transcript.push_str(&message.text_content());
            transcript.push('\n');
        }

        let body = SummaryRequestBody {
            model: &self.route.upstream_model,
            messages: vec![
                serde_json::json!({
                    "role": "system",
                    "content": "Summarize the following conversation fragment so it can stand in for the original messages. Keep decisions, facts and open threads; drop pleasantries.",
                }),
                serde_json::json!({"role": "user", "content": transcript}),
            ],
            stream: false,
        };
        let payload = serde_json::to_vec(&body).ok()?;

        let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
        if let Some(credential) = &self.route.credential {
            headers.push(("authorization".to_string(), format!("Bearer {credential}")));
        }

        let response = self
            .client
            .send(UpstreamRequest {
                method: HttpMethod::Post,
                url: format!("{}/chat/completions", self.route.base_url),
                headers,
                body: Some(Bytes::from(payload)),
                is_stream: false,
                timeouts: self.route.timeouts,
            })
            .await
            .ok()?;

        if !(200..300).contains(&response.status) {
            return None;
        }
        let UpstreamBody::Bytes(bytes) = response.body else {
            return None;
        };
        let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
        value
            .get("choices")?
            .get(0)?
            .get("message")?
            .get("content")?
            .as_str()
            .map(str::to_string)
    }
}

fn placeholder_summary(dropped: usize, dropped_tokens: i64) -> String {
    format!("[context compacted: {dropped} earlier messages elided, {dropped_tokens} tokens]")
}

#[derive(Debug, Clone, Serialize)]
pub struct CompactionPreview {
    pub session_id: i64,
    pub tokens_before: i64,
    pub projected_tokens_after: i64,
    pub messages_kept: usize,
    pub messages_dropped: usize,
    pub headroom_after: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompactionOutcome {
    pub session_id: i64,
    pub tokens_before: i64,
    pub tokens_after: i64,
    pub messages_kept: i32,
    pub messages_dropped: i32,
}

pub struct Compactor {
    store: Arc<dyn Store>,
    hub: ObserverHub,
    tokenizer: Tokenizer,
    registry: Arc<SessionRegistry>,
    policy: CompactionPolicy,
    summarizer: Arc<dyn Summarizer>,
}

impl Compactor {
    pub fn new(
        store: Arc<dyn Store>,
        hub: ObserverHub,
        tokenizer: Tokenizer,
        registry: Arc<SessionRegistry>,
        policy: CompactionPolicy,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            store,
            hub,
            tokenizer,
            registry,
            policy,
            summarizer,
        }
    }

    pub fn policy(&self) -> &CompactionPolicy {
        &self.policy
    }

    /// Projected before/after without touching any state. Pure over the
    /// cached history, so calling it twice yields the same answer.
    pub fn preview(&self, session: &SessionHandle) -> Result<CompactionPreview, ProxyError> {
        let history = self.history_for(session)?;
        let counts = self.tokenizer.message_counts(&history);
        let plan = plan_compaction(
            &history,
            &counts,
            session.max_context,
            session.reserved_tokens,
            &self.policy,
        );

        let projected = self.project(&history, &plan, None);
        Ok(CompactionPreview {
            session_id: session.id,
            tokens_before: plan.tokens_before,
            projected_tokens_after: projected,
            messages_kept: plan.kept.len(),
            messages_dropped: plan.dropped.len(),
            headroom_after: session.max_context - session.reserved_tokens - projected,
        })
    }

    pub async fn execute(
        &self,
        session: &SessionHandle,
        trigger: CompactionTrigger,
    ) -> Result<CompactionOutcome, ProxyError> {
        if trigger == CompactionTrigger::Auto {
            let runs = self.registry.auto_compaction_count(session.id);
            if runs >= self.policy.max_consecutive {
                return Err(ProxyError::new(
                    ErrorKind::CompactionCooldown,
                    format!("consecutive automatic compaction ceiling ({runs}) reached"),
                ));
            }
        }
        self.check_cooldown(session.id).await?;

        let history = self.history_for(session)?;
        let counts = self.tokenizer.message_counts(&history);
        let plan = plan_compaction(
            &history,
            &counts,
            session.max_context,
            session.reserved_tokens,
            &self.policy,
        );
        if plan.dropped.is_empty() {
            return Err(ProxyError::new(
                ErrorKind::CompactionNoGain,
                "no messages eligible for replacement",
            ));
        }

        let dropped_messages: Vec<ChatMessage> =
            plan.dropped.iter().map(|&i| history[i].clone()).collect();
        let summary = match self.summarizer.summarize(&dropped_messages).await {
            Some(text) => text,
            None => placeholder_summary(plan.dropped.len(), plan.dropped_tokens),
        };

        let rewritten = self.rewrite(&history, &plan, &summary);
        let tokens_after = self.tokenizer.count_messages(&rewritten);
        let floor = (plan.tokens_before as f64 * (1.0 - self.policy.min_gain)) as i64;
        if tokens_after > floor {
            return Err(ProxyError::new(
                ErrorKind::CompactionNoGain,
                format!(
                    "compaction would keep {tokens_after} of {} tokens, under the required gain",
                    plan.tokens_before
                ),
            ));
        }

        let outcome = CompactionOutcome {
            session_id: session.id,
            tokens_before: plan.tokens_before,
            tokens_after,
            messages_kept: plan.kept.len() as i32,
            messages_dropped: plan.dropped.len() as i32,
        };

        self.store
            .append_compaction(NewCompaction {
                session_id: session.id,
                tokens_before: outcome.tokens_before,
                tokens_after: outcome.tokens_after,
                strategy: match trigger {
                    CompactionTrigger::Manual => "manual".to_string(),
                    CompactionTrigger::Auto => "auto".to_string(),
                },
                messages_kept: outcome.messages_kept,
                messages_dropped: outcome.messages_dropped,
            })
            .await
            .map_err(|err| ProxyError::new(ErrorKind::StorageError, err.to_string()))?;

        self.registry.replace_history(session.id, rewritten);
        match trigger {
            CompactionTrigger::Auto => {
                let runs = self.registry.note_auto_compaction(session.id);
                info!(
                    event = "compaction",
                    session_id = session.id,
                    trigger = "auto",
                    consecutive = runs,
                    tokens_before = outcome.tokens_before,
                    tokens_after = outcome.tokens_after
                );
            }
            CompactionTrigger::Manual => {
                self.registry.reset_auto_compactions(session.id);
                info!(
                    event = "compaction",
                    session_id = session.id,
                    trigger = "manual",
                    tokens_before = outcome.tokens_before,
                    tokens_after = outcome.tokens_after
                );
            }
        }

        self.hub.publish(Notice::CompactionDone {
            session_id: session.id,
            tokens_before: outcome.tokens_before,
            tokens_after: outcome.tokens_after,
            messages_kept: outcome.messages_kept,
            messages_dropped: outcome.messages_dropped,
        });
        Ok(outcome)
    }

    fn history_for(&self, session: &SessionHandle) -> Result<Vec<ChatMessage>, ProxyError> {
        self.registry.history(session.id).ok_or_else(|| {
            ProxyError::new(
                ErrorKind::CompactionNoGain,
                "session has no cached conversation to compact",
            )
        })
    }

    async fn check_cooldown(&self, session_id: i64) -> Result<(), ProxyError> {
        let last = self
            .store
            .last_compaction(session_id)
            .await
            .map_err(|err| ProxyError::new(ErrorKind::StorageError, err.to_string()))?;
        if let Some(record) = last {
            let elapsed = OffsetDateTime::now_utc() - record.at;
            if elapsed < self.policy.cooldown {
                warn!(
                    event = "compaction_cooldown",
                    session_id,
                    elapsed_secs = elapsed.whole_seconds()
                );
                return Err(ProxyError::new(
                    ErrorKind::CompactionCooldown,
                    format!(
                        "previous compaction {}s ago is inside the {}s cooldown",
                        elapsed.whole_seconds(),
                        self.policy.cooldown.as_secs()
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Kept messages in original order, the summary standing where the
    /// dropped prefix began.
    fn rewrite(
        &self,
        history: &[ChatMessage],
        plan: &CompactionPlan,
        summary: &str,
    ) -> Vec<ChatMessage> {
        let first_dropped = plan.dropped.first().copied();
        let mut out = Vec::with_capacity(plan.kept.len() + 1);
        for (idx, message) in history.iter().enumerate() {
            if Some(idx) == first_dropped {
                out.push(ChatMessage::text("assistant", summary));
            }
            if plan.dropped.binary_search(&idx).is_ok() {
                continue;
            }
            out.push(message.clone());
        }
        out
    }

    fn project(&self, history: &[ChatMessage], plan: &CompactionPlan, summary: Option<&str>) -> i64 {
        let summary = summary
            .map(str::to_string)
            .unwrap_or_else(|| placeholder_summary(plan.dropped.len(), plan.dropped_tokens));
        if plan.dropped.is_empty() {
            return plan.tokens_before;
        }
        let rewritten = self.rewrite(history, plan, &summary);
        self.tokenizer.count_messages(&rewritten)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CompactionPolicy {
        CompactionPolicy {
            keep_recent: 5,
            target_ratio: 0.5,
            min_gain: 0.2,
            cooldown: Duration::from_secs(300),
            max_consecutive: 3,
        }
    }

    fn message(role: &str, idx: usize) -> ChatMessage {
        ChatMessage::text(role, &format!("message {idx}"))
    }

    #[test]
    fn plan_preserves_system_and_recent() {
        // One system + ten alternating turns, synthetic counts: 50 + 10×85.
        let mut messages = vec![message("system", 0)];
        let mut counts = vec![50_i64];
        for idx in 1..=10 {
            messages.push(message(if idx % 2 == 1 { "user" } else { "assistant" }, idx));
            counts.push(85);
        }

        let plan = plan_compaction(&messages, &counts, 1000, 0, &policy());
        assert_eq!(plan.tokens_before, 900);
        // System always kept.
        assert!(plan.kept.contains(&0));
        // Last 5 conversational messages kept.
        for idx in 6..=10 {
            assert!(plan.kept.contains(&idx), "recent {idx} must survive");
        }
        // 50 + 425 = 475 < 500, one middle message crosses the budget.
        assert!(plan.kept.contains(&5));
        assert_eq!(plan.dropped, vec![1, 2, 3, 4]);
        assert_eq!(plan.dropped_tokens, 4 * 85);
    }

    #[test]
    fn plan_with_reserved_tokens_shrinks_budget() {
        let mut messages = vec![message("system", 0)];
        let mut counts = vec![50_i64];
        for idx in 1..=10 {
            messages.push(message("user", idx));
            counts.push(85);
        }
        let without = plan_compaction(&messages, &counts, 1000, 0, &policy());
        let with = plan_compaction(&messages, &counts, 1000, 400, &policy());
        assert!(with.dropped.len() >= without.dropped.len());
    }

    #[test]
    fn plan_keeps_everything_when_history_is_short() {
        let messages = vec![message("system", 0), message("user", 1)];
        let counts = vec![10, 20];
        let plan = plan_compaction(&messages, &counts, 1000, 0, &policy());
        assert!(plan.dropped.is_empty());
        assert_eq!(plan.kept, vec![0, 1]);
    }

    #[test]
    fn placeholder_names_the_elision() {
        let text = placeholder_summary(4, 340);
        assert!(text.contains('4'));
        assert!(text.contains("340"));
    }
}
