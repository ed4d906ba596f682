use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unresolved credential reference ${{{0}}}")]
    UnresolvedCredential(String),
    #[error("model {model} references unknown provider {provider}")]
    UnknownProvider { model: String, provider: String },
    #[error("provider {provider} fallback {fallback} is not configured")]
    UnknownFallback { provider: String, fallback: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Upstream dialect. Closed set; the streaming proxy dispatches on it once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderType {
    OpenaiCompatible,
    GeminiNative,
    KimiCoding,
    OpenaiLegacy,
}

impl ProviderType {
    pub fn is_openai_family(&self) -> bool {
        !matches!(self, ProviderType::GeminiNative)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::OpenaiCompatible => "openai-compatible",
            ProviderType::GeminiNative => "gemini-native",
            ProviderType::KimiCoding => "kimi-coding",
            ProviderType::OpenaiLegacy => "openai-legacy",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    pub base_url: String,
    /// `${NAME}` reference in the file; holds the expanded secret after load.
    #[serde(default)]
    pub credential: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Smart-routing hints.
    #[serde(default)]
    pub cost_per_mtok: Option<f64>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    /// Provider tried on the cross-provider 5xx retry, when configured.
    #[serde(default)]
    pub fallback: Option<String>,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_stream_idle_timeout() -> u64 {
    60
}
fn default_request_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub upstream: String,
    pub max_context: i64,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_dsn")]
    pub database: String,
    #[serde(default)]
    pub pid_file: Option<String>,
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: default_dsn(),
            pid_file: None,
            log_file: None,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8100
}
fn default_dsn() -> String {
    "sqlite://kproxy.db?mode=rwc".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub auto_session: bool,
    pub context_precheck: bool,
    pub precheck_ratio: f64,
    pub retry_attempts: u32,
    pub chunk_channel_capacity: usize,
    pub hub_queue_depth: usize,
    pub snapshot_metrics: usize,
    pub auto_compact: bool,
    pub auto_compact_threshold: f64,
    pub compact_cooldown_secs: u64,
    pub compact_max_consecutive: u32,
    pub compact_target_ratio: f64,
    pub compact_min_gain: f64,
    pub compact_keep_pairs: usize,
    pub sanitizer_threshold: usize,
    pub sanitizer_head: usize,
    pub sanitizer_tail: usize,
    pub blob_ttl_days: i64,
    pub memory_promote_threshold: i64,
    /// Client model key used for compaction summaries; placeholder text is
    /// substituted when unset or unreachable.
    pub summary_model: Option<String>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            auto_session: true,
            context_precheck: true,
            precheck_ratio: 0.95,
            retry_attempts: 2,
            chunk_channel_capacity: 32,
            hub_queue_depth: 64,
            snapshot_metrics: 20,
            auto_compact: true,
            auto_compact_threshold: 0.85,
            compact_cooldown_secs: 300,
            compact_max_consecutive: 3,
            compact_target_ratio: 0.5,
            compact_min_gain: 0.2,
            compact_keep_pairs: 5,
            sanitizer_threshold: 4000,
            sanitizer_head: 2000,
            sanitizer_tail: 2000,
            blob_ttl_days: 30,
            memory_promote_threshold: 5,
            summary_model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpPeerConfig {
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub mcp: BTreeMap<String, McpPeerConfig>,
}

impl ProxyConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text, |name| std::env::var(name).ok())
    }

    /// Decode and validate. `lookup` resolves `${NAME}` credential
    /// references; expansion happens here, exactly once.
    pub fn from_toml(
        text: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config: ProxyConfig = toml::from_str(text)?;

        for provider in config.providers.values_mut() {
            if let Some(reference) = provider.credential.take() {
                provider.credential = Some(expand_credential(&reference, &lookup)?);
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (key, model) in &self.models {
            if !self.providers.contains_key(&model.provider) {
                return Err(ConfigError::UnknownProvider {
                    model: key.clone(),
                    provider: model.provider.clone(),
                });
            }
            if model.max_context <= 0 {
                return Err(ConfigError::Invalid(format!(
                    "model {key} has non-positive max_context"
                )));
            }
        }
        for (key, provider) in &self.providers {
            if provider.base_url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "provider {key} has empty base_url"
                )));
            }
            if let Some(fallback) = &provider.fallback {
                if !self.providers.contains_key(fallback) {
                    return Err(ConfigError::UnknownFallback {
                        provider: key.clone(),
                        fallback: fallback.clone(),
                    });
                }
            }
        }
        if !(0.0..=1.0).contains(&self.features.precheck_ratio)
            || !(0.0..=1.0).contains(&self.features.auto_compact_threshold)
            || !(0.0..=1.0).contains(&self.features.compact_target_ratio)
            || !(0.0..=1.0).contains(&self.features.compact_min_gain)
        {
            return Err(ConfigError::Invalid(
                "ratio features must lie in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

fn expand_credential(
    reference: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    let trimmed = reference.trim();
    let Some(name) = trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    else {
        // Literal credential values are allowed (fixtures, tests).
        return Ok(trimmed.to_string());
    };
    lookup(name)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ConfigError::UnresolvedCredential(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[server]
host = "127.0.0.1"
port = 9000

[providers.nv]
type = "openai-compatible"
base_url = "https://integrate.api.nvidia.com/v1"
credential = "${NV_KEY}"
cost_per_mtok = 0.6
latency_ms = 900.0

[providers.gem]
type = "gemini-native"
base_url = "https://generativelanguage.googleapis.com/v1beta"
credential = "${GEM_KEY}"

[models."nvidia/kimi-k2-thinking"]
provider = "nv"
upstream = "moonshotai/kimi-k2-thinking"
max_context = 262144

[features]
retry_attempts = 3
"#;

    fn env(name: &str) -> Option<String> {
        match name {
            "NV_KEY" => Some("nv-secret".to_string()),
            "GEM_KEY" => Some("gem-secret".to_string()),
            _ => None,
        }
    }

    #[test]
    fn loads_and_expands_credentials() {
        let config = ProxyConfig::from_toml(SAMPLE, env).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(
            config.providers["nv"].credential.as_deref(),
            Some("nv-secret")
        );
        assert_eq!(config.features.retry_attempts, 3);
        assert_eq!(config.features.hub_queue_depth, 64);
        assert_eq!(
            config.models["nvidia/kimi-k2-thinking"].max_context,
            262144
        );
    }

    #[test]
    fn unresolved_credential_is_fatal() {
        let err = ProxyConfig::from_toml(SAMPLE, |_| None).unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedCredential(name) if name == "NV_KEY"));
    }

    #[test]
    fn unknown_model_provider_is_rejected() {
        let text = r#"
[providers.a]
type = "openai-compatible"
base_url = "http://x"

[models.m]
provider = "missing"
upstream = "m"
max_context = 1000
"#;
        let err = ProxyConfig::from_toml(text, |_| None).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProvider { .. }));
    }

    #[test]
    fn unknown_fallback_is_rejected() {
        let text = r#"
[providers.a]
type = "openai-compatible"
base_url = "http://x"
fallback = "ghost"
"#;
        let err = ProxyConfig::from_toml(text, |_| None).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownFallback { .. }));
    }

    #[test]
    fn literal_credentials_pass_through() {
        let text = r#"
[providers.a]
type = "kimi-coding"
base_url = "http://fixture"
credential = "sk-plain"
"#;
        let config = ProxyConfig::from_toml(text, |_| None).unwrap();
        assert_eq!(config.providers["a"].credential.as_deref(), Some("sk-plain"));
    }
}
