use std::sync::Arc;
use std::time::Duration;

use kproxy_common::{ErrorKind, ProviderType, ProxyConfig, ProxyError};
use kproxy_protocol::openai::{ModelEntry, ModelList};

use crate::upstream::TimeoutProfile;

/// Everything the streaming proxy needs to hit one upstream once.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub provider_key: String,
    pub provider_type: ProviderType,
    pub base_url: String,
    pub host_header: Option<String>,
    pub upstream_model: String,
    pub credential: Option<String>,
    pub timeouts: TimeoutProfile,
    pub fallback: Option<String>,
    pub max_context: Option<i64>,
}

pub struct Router {
    config: Arc<ProxyConfig>,
    /// The proxy's own host:port, for loop detection.
    listen_host: String,
    listen_port: u16,
}

impl Router {
    pub fn new(config: Arc<ProxyConfig>, listen_host: String, listen_port: u16) -> Self {
        Self {
            config,
            listen_host,
            listen_port,
        }
    }

    /// Exact lookup first; otherwise the suffix after the first `/`.
    /// Upstream names are fixed points, which keeps the mapping idempotent.
    pub fn map_model(&self, client_key: &str) -> String {
        if let Some(model) = self.config.models.get(client_key) {
            return model.upstream.clone();
        }
        if self
            .config
            .models
            .values()
            .any(|model| model.upstream == client_key)
        {
            return client_key.to_string();
        }
        match client_key.split_once('/') {
            Some((_, suffix)) if !suffix.is_empty() => suffix.to_string(),
            _ => client_key.to_string(),
        }
    }

    /// Resolve a client model against a session's provider binding.
    pub fn resolve(
        &self,
        client_model: &str,
        session_provider: Option<&str>,
    ) -> Result<RouteDecision, ProxyError> {
        let (provider_key, upstream_model, max_context) =
            if let Some(model) = self.config.models.get(client_model) {
                (
                    model.provider.clone(),
                    model.upstream.clone(),
                    Some(model.max_context),
                )
            } else if let Some(provider) = session_provider {
                (
                    provider.to_string(),
                    self.map_model(client_model),
                    None,
                )
            } else if let Some(provider) = self.select_provider_for_model(client_model, 0) {
                // Smart mode: an unknown alias whose family is served by
                // configured providers goes to the best-scoring one.
                (provider, self.map_model(client_model), None)
            } else {
                return Err(ProxyError::new(
                    ErrorKind::UnknownModel,
                    format!("model {client_model} is not configured"),
                ));
            };

        let Some(provider) = self.config.providers.get(&provider_key) else {
            return Err(ProxyError::new(
                ErrorKind::UnknownModel,
                format!("model {client_model} references unknown provider {provider_key}"),
            ));
        };

        let decision = RouteDecision {
            provider_key: provider_key.clone(),
            provider_type: provider.provider_type,
            base_url: provider.base_url.trim_end_matches('/').to_string(),
            host_header: host_of(&provider.base_url).map(|(host, _)| host),
            upstream_model,
            credential: provider.credential.clone(),
            timeouts: TimeoutProfile {
                connect_secs: provider.connect_timeout_secs,
                request_secs: provider.request_timeout_secs,
                stream_idle_secs: provider.stream_idle_timeout_secs,
            },
            fallback: provider.fallback.clone(),
            max_context,
        };

        if self.targets_self(&decision.base_url) {
            return Err(ProxyError::new(
                ErrorKind::LoopDetected,
                format!("provider {provider_key} targets the proxy's own listener"),
            ));
        }

        Ok(decision)
    }

    /// Rebuild a decision against another provider, keeping the model family.
    /// Used for the cross-provider 5xx retry.
    pub fn resolve_fallback(
        &self,
        fallback_key: &str,
        upstream_model: &str,
    ) -> Option<RouteDecision> {
        let provider = self.config.providers.get(fallback_key)?;
        let decision = RouteDecision {
            provider_key: fallback_key.to_string(),
            provider_type: provider.provider_type,
            base_url: provider.base_url.trim_end_matches('/').to_string(),
            host_header: host_of(&provider.base_url).map(|(host, _)| host),
            upstream_model: upstream_model.to_string(),
            credential: provider.credential.clone(),
            timeouts: TimeoutProfile {
                connect_secs: provider.connect_timeout_secs,
                request_secs: provider.request_timeout_secs,
                stream_idle_secs: provider.stream_idle_timeout_secs,
            },
            fallback: None,
            max_context: None,
        };
        (!self.targets_self(&decision.base_url)).then_some(decision)
    }

    /// Smart mode: pick the provider for a model family by weighted score.
    /// `used_tokens` is the session's current input footprint; each
    /// candidate's headroom is measured against its own context window.
    pub fn select_provider_for_model(&self, client_key: &str, used_tokens: i64) -> Option<String> {
        let family = family_of(client_key);
        let mut candidates: Vec<Candidate> = Vec::new();
        for (key, model) in &self.config.models {
            if family_of(key) != family {
                continue;
            }
            let Some(provider) = self.config.providers.get(&model.provider) else {
                continue;
            };
            candidates.push(Candidate {
                provider_key: model.provider.clone(),
                context_limit: model.max_context as f64,
                inv_cost: 1.0 / provider.cost_per_mtok.filter(|c| *c > 0.0).unwrap_or(1.0),
                inv_latency: 1.0 / provider.latency_ms.filter(|l| *l > 0.0).unwrap_or(1000.0),
                headroom: (model.max_context - used_tokens).max(0) as f64,
            });
        }
        if candidates.is_empty() {
            return None;
        }

        let max_context = fold_max(candidates.iter().map(|c| c.context_limit));
        let max_inv_cost = fold_max(candidates.iter().map(|c| c.inv_cost));
        let max_inv_latency = fold_max(candidates.iter().map(|c| c.inv_latency));
        let max_headroom = fold_max(candidates.iter().map(|c| c.headroom));

        // Stable tie-break: iterate keys in order, replace on strictly
        // greater score only.
        candidates.sort_by(|a, b| a.provider_key.cmp(&b.provider_key));
        let mut best: Option<(f64, &Candidate)> = None;
        for candidate in &candidates {
            let score = 0.4 * norm(candidate.context_limit, max_context)
                + 0.3 * norm(candidate.inv_cost, max_inv_cost)
                + 0.2 * norm(candidate.inv_latency, max_inv_latency)
                + 0.1 * norm(candidate.headroom, max_headroom);
            match best {
                Some((best_score, _)) if score <= best_score => {}
                _ => best = Some((score, candidate)),
            }
        }
        best.map(|(_, c)| c.provider_key.clone())
    }

    /// OpenAI-compatible discovery payload from the configured table.
    pub fn models_list(&self) -> ModelList {
        let data = self
            .config
            .models
            .iter()
            .map(|(key, model)| ModelEntry {
                id: key.clone(),
                object: "model",
                owned_by: model.provider.clone(),
                root: model.upstream.clone(),
            })
            .collect();
        ModelList::new(data)
    }

    fn targets_self(&self, base_url: &str) -> bool {
        let Some((host, port)) = host_of(base_url) else {
            return false;
        };
        let port = port.unwrap_or(default_port(base_url));
        port == self.listen_port && hosts_alias(&host, &self.listen_host)
    }
}

struct Candidate {
    provider_key: String,
    context_limit: f64,
    inv_cost: f64,
    inv_latency: f64,
    headroom: f64,
}

fn fold_max(values: impl Iterator<Item = f64>) -> f64 {
    values.fold(0.0_f64, f64::max)
}

fn norm(value: f64, max: f64) -> f64 {
    if max > 0.0 { value / max } else { 0.0 }
}

fn family_of(client_key: &str) -> &str {
    client_key
        .split_once('/')
        .map(|(_, suffix)| suffix)
        .unwrap_or(client_key)
}

fn host_of(url: &str) -> Option<(String, Option<u16>)> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let authority = rest.split(['/', '?', '#']).next()?;
    if authority.is_empty() {
        return None;
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => Some((host.to_string(), Some(port))),
            Err(_) => Some((authority.to_string(), None)),
        },
        None => Some((authority.to_string(), None)),
    }
}

fn default_port(url: &str) -> u16 {
    if url.starts_with("https://") { 443 } else { 80 }
}

/// Loopback spellings and the wildcard bind all collide with each other.
fn hosts_alias(a: &str, b: &str) -> bool {
    if a.eq_ignore_ascii_case(b) {
        return true;
    }
    let loopback = ["127.0.0.1", "localhost", "0.0.0.0", "::1", "[::1]"];
    loopback.contains(&a.to_ascii_lowercase().as_str())
        && loopback.contains(&b.to_ascii_lowercase().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kproxy_common::{ModelConfig, ProviderConfig};

    fn provider(provider_type: ProviderType, base_url: &str) -> ProviderConfig {
        ProviderConfig {
            provider_type,
            base_url: base_url.to_string(),
            credential: Some("secret".to_string()),
            connect_timeout_secs: 10,
            stream_idle_timeout_secs: 60,
            request_timeout_secs: 120,
            cost_per_mtok: None,
            latency_ms: None,
            fallback: None,
        }
    }

    fn model(provider: &str, upstream: &str, max_context: i64) -> ModelConfig {
        ModelConfig {
            provider: provider.to_string(),
            upstream: upstream.to_string(),
            max_context,
            capabilities: Vec::new(),
        }
    }

    fn router(config: ProxyConfig) -> Router {
        Router::new(Arc::new(config), "127.0.0.1".to_string(), 8100)
    }

    fn base_config() -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.providers.insert(
            "nv".to_string(),
            provider(ProviderType::OpenaiCompatible, "https://integrate.api.nvidia.com/v1"),
        );
        config.models.insert(
            "nvidia/kimi-k2-thinking".to_string(),
            model("nv", "moonshotai/kimi-k2-thinking", 262_144),
        );
        config
    }

    #[test]
    fn map_model_prefers_exact_entry() {
        let router = router(base_config());
        assert_eq!(
            router.map_model("nvidia/kimi-k2-thinking"),
            "moonshotai/kimi-k2-thinking"
        );
    }

    #[test]
    fn map_model_falls_back_to_suffix() {
        let router = router(base_config());
        assert_eq!(router.map_model("acme/some-model"), "some-model");
        assert_eq!(router.map_model("plain"), "plain");
    }

    #[test]
    fn map_model_is_idempotent() {
        let router = router(base_config());
        for key in ["nvidia/kimi-k2-thinking", "acme/some-model", "plain"] {
            let once = router.map_model(key);
            assert_eq!(router.map_model(&once), once);
        }
    }

    #[test]
    fn resolve_fills_decision_from_model_table() {
        let router = router(base_config());
        let decision = router.resolve("nvidia/kimi-k2-thinking", None).unwrap();
        assert_eq!(decision.provider_key, "nv");
        assert_eq!(decision.upstream_model, "moonshotai/kimi-k2-thinking");
        assert_eq!(decision.max_context, Some(262_144));
        assert_eq!(decision.timeouts.connect_secs, 10);
    }

    #[test]
    fn resolve_unknown_model_without_session_fails() {
        let router = router(base_config());
        let err = router.resolve("ghost/model", None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownModel);
    }

    #[test]
    fn resolve_unknown_model_rides_session_provider() {
        let router = router(base_config());
        let decision = router.resolve("acme/other", Some("nv")).unwrap();
        assert_eq!(decision.provider_key, "nv");
        assert_eq!(decision.upstream_model, "other");
    }

    #[test]
    fn loop_detection_rejects_self_target() {
        let mut config = base_config();
        config.providers.insert(
            "selfish".to_string(),
            provider(ProviderType::OpenaiCompatible, "http://localhost:8100/v1"),
        );
        config
            .models
            .insert("loop/m".to_string(), model("selfish", "m", 1000));
        let router = router(config);
        let err = router.resolve("loop/m", None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::LoopDetected);
    }

    #[test]
    fn loop_detection_allows_other_ports() {
        let mut config = base_config();
        config.providers.insert(
            "local".to_string(),
            provider(ProviderType::OpenaiCompatible, "http://127.0.0.1:9999"),
        );
        config
            .models
            .insert("local/m".to_string(), model("local", "m", 1000));
        let router = router(config);
        assert!(router.resolve("local/m", None).is_ok());
    }

    #[test]
    fn provider_scoring_prefers_bigger_window_then_key_order() {
        let mut config = ProxyConfig::default();
        for (key, cost) in [("alpha", 1.0), ("beta", 1.0)] {
            let mut p = provider(ProviderType::OpenaiCompatible, "http://upstream");
            p.cost_per_mtok = Some(cost);
            p.latency_ms = Some(1000.0);
            config.providers.insert(key.to_string(), p);
        }
        config
            .models
            .insert("alpha/fam".to_string(), model("alpha", "fam", 100_000));
        config
            .models
            .insert("beta/fam".to_string(), model("beta", "fam", 50_000));
        let router = router(config);
        assert_eq!(
            router.select_provider_for_model("x/fam", 0).as_deref(),
            Some("alpha")
        );
    }

    #[test]
    fn provider_scoring_ties_break_lexicographically() {
        let mut config = ProxyConfig::default();
        for key in ["zeta", "eta"] {
            config.providers.insert(
                key.to_string(),
                provider(ProviderType::OpenaiCompatible, "http://upstream"),
            );
            config
                .models
                .insert(format!("{key}/fam"), model(key, "fam", 10_000));
        }
        let router = router(config);
        assert_eq!(
            router.select_provider_for_model("any/fam", 0).as_deref(),
            Some("eta")
        );
    }

    #[test]
    fn models_list_is_openai_shaped() {
        let router = router(base_config());
        let list = router.models_list();
        assert_eq!(list.object, "list");
        assert_eq!(list.data[0].id, "nvidia/kimi-k2-thinking");
        assert_eq!(list.data[0].owned_by, "nv");
    }
}
