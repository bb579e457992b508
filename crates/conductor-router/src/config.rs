use conductor_core::{ConductorError, ConductorResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wire flavor of an HTTP provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Any OpenAI-compatible `/v1/chat/completions` endpoint.
    #[serde(alias = "open_ai")]
    OpenAi,
    /// Anthropic `/v1/messages`.
    Anthropic,
}

/// One `[[providers]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Stable id; health scores are persisted under it.
    pub id: String,
    pub kind: ProviderKind,
    pub model: String,
    /// Inline key. Prefer `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

impl ProviderConfig {
    /// Endpoint root, defaulting per kind.
    pub fn base_url(&self) -> &str {
        if let Some(url) = &self.base_url {
            url.trim_end_matches('/')
        } else {
            match self.kind {
                ProviderKind::OpenAi => "https://api.openai.com",
                ProviderKind::Anthropic => "https://api.anthropic.com",
            }
        }
    }

    /// The API key, from `api_key` or the named environment variable.
    pub fn resolve_api_key(&self) -> ConductorResult<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(key.clone());
        }
        match &self.api_key_env {
            Some(var) => std::env::var(var).map_err(|_| {
                ConductorError::Config(format!(
                    "provider '{}': environment variable {var} is not set",
                    self.id
                ))
            }),
            None => Err(ConductorError::Config(format!(
                "provider '{}' needs api_key or api_key_env",
                self.id
            ))),
        }
    }
}

/// Tunables for scoring, retry, probing and quarantine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterPolicy {
    /// Attempts per provider for transient failures (first try included).
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
    /// Uniform jitter applied to each delay, as a fraction of it.
    pub jitter_ratio: f64,
    /// Health added on success.
    pub success_delta: u8,
    /// Health removed on each failed attempt.
    pub failure_penalty: u8,
    /// Providers scoring below this are only probed.
    pub low_health_threshold: u8,
    /// Chance that a low-health provider is included in a call's plan.
    pub probe_probability: f64,
    /// Health added when a probe succeeds, instead of `success_delta`.
    pub probe_success_bonus: u8,
    /// Cooldown after an authentication failure.
    pub quarantine_secs: u64,
    /// Bound on each provider call.
    pub request_timeout_secs: u64,
    /// Completions kept for degraded answers.
    pub cache_capacity: usize,
}

impl Default for RouterPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            jitter_ratio: 0.25,
            success_delta: 5,
            failure_penalty: 15,
            low_health_threshold: 30,
            probe_probability: 0.1,
            probe_success_bonus: 20,
            quarantine_secs: 300,
            request_timeout_secs: 120,
            cache_capacity: 256,
        }
    }
}

impl RouterPolicy {
    /// Reject values that would make routing meaningless.
    pub fn validate(&self) -> ConductorResult<()> {
        if self.max_attempts == 0 {
            return Err(ConductorError::Config("router.max_attempts must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.probe_probability) {
            return Err(ConductorError::Config(
                "router.probe_probability must be within 0..=1".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter_ratio) {
            return Err(ConductorError::Config(
                "router.jitter_ratio must be within 0..1".into(),
            ));
        }
        if self.low_health_threshold > 100 {
            return Err(ConductorError::Config(
                "router.low_health_threshold must be <= 100".into(),
            ));
        }
        Ok(())
    }

    /// Per-call deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Quarantine length.
    pub fn quarantine(&self) -> chrono::Duration {
        const YEAR_SECS: u64 = 365 * 24 * 3600;
        chrono::Duration::seconds(self.quarantine_secs.min(YEAR_SECS) as i64)
    }
}

/// Exponential backoff for `attempt` (zero-based), capped at `backoff_max_ms`.
pub fn compute_backoff(policy: &RouterPolicy, attempt: u32) -> u64 {
    let delay = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}

/// Spread `delay_ms` uniformly by ± `ratio` of itself.
pub fn with_jitter(delay_ms: u64, ratio: f64, rng: &mut impl Rng) -> u64 {
    if delay_ms == 0 || ratio <= 0.0 {
        return delay_ms;
    }
    let spread = delay_ms as f64 * ratio;
    let jittered = delay_ms as f64 + rng.gen_range(-spread..=spread);
    jittered.max(0.0).round() as u64
}
