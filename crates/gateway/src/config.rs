//! Gateway configuration.
//!
//! Everything tunable lives here: the provider capability table, the
//! category → technique mapping, limiter/breaker/dedup/classifier knobs,
//! and round-table scoring weights. Loaded from TOML with sensible
//! defaults for every field; endpoint API keys are resolved from the
//! environment at client-construction time, never stored in config.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::classifier::{TaskCategory, TechniqueMap};
use crate::provider::ProviderId;
use crate::request::Usage;
use crate::router::SelectionStrategy;

/// Network endpoint for the built-in OpenAI-compatible HTTP client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    /// Base URL, e.g. `https://api.example.com/v1`.
    pub url: String,
    /// Model name sent in the request body.
    pub model: String,
    /// Name of the environment variable holding the API key, if any.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

/// Static capability description of one provider.
///
/// Read-only at runtime; live health lives in the registry and breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: ProviderId,
    /// Per-category strength, 0–10. Zero means the provider is not
    /// eligible for that category at all.
    #[serde(default)]
    pub strengths: HashMap<TaskCategory, u8>,
    /// Strength assumed for categories not listed in `strengths`.
    #[serde(default = "default_strength")]
    pub default_strength: u8,
    /// Relative cost tier, 1 = cheapest.
    #[serde(default = "default_cost_tier")]
    pub cost_tier: u8,
    /// Priority weight; lower is preferred by the priority strategy.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Per-call timeout budget in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Price per 1K prompt tokens, USD.
    #[serde(default)]
    pub input_price_per_1k: f64,
    /// Price per 1K completion tokens, USD.
    #[serde(default)]
    pub output_price_per_1k: f64,
    /// Endpoint for the built-in HTTP client. Absent for providers
    /// registered programmatically (e.g. in tests).
    #[serde(default)]
    pub endpoint: Option<ProviderEndpoint>,
}

fn default_strength() -> u8 {
    5
}
fn default_cost_tier() -> u8 {
    2
}
fn default_priority() -> u32 {
    10
}
fn default_timeout_ms() -> u64 {
    30_000
}

impl ProviderDescriptor {
    pub fn new(name: impl Into<ProviderId>) -> Self {
        Self {
            name: name.into(),
            strengths: HashMap::new(),
            default_strength: default_strength(),
            cost_tier: default_cost_tier(),
            priority: default_priority(),
            timeout_ms: default_timeout_ms(),
            input_price_per_1k: 0.0,
            output_price_per_1k: 0.0,
            endpoint: None,
        }
    }

    pub fn with_strength(mut self, category: TaskCategory, strength: u8) -> Self {
        self.strengths.insert(category, strength.min(10));
        self
    }

    pub fn with_cost_tier(mut self, tier: u8) -> Self {
        self.cost_tier = tier;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_pricing(mut self, input_per_1k: f64, output_per_1k: f64) -> Self {
        self.input_price_per_1k = input_per_1k;
        self.output_price_per_1k = output_per_1k;
        self
    }

    /// Strength for a category, falling back to the default strength.
    pub fn strength_for(&self, category: TaskCategory) -> u8 {
        self.strengths
            .get(&category)
            .copied()
            .unwrap_or(self.default_strength)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Estimated cost of a completed call, from configured per-1K pricing.
    pub fn estimate_cost(&self, usage: &Usage) -> f64 {
        let input = usage.prompt_tokens as f64 / 1000.0 * self.input_price_per_1k;
        let output = usage.completion_tokens as f64 / 1000.0 * self.output_price_per_1k;
        input + output
    }
}

/// Token-bucket rate limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Burst capacity per key.
    pub capacity: f64,
    /// Sustained refill rate, tokens per second.
    pub refill_rate: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 20.0,
            refill_rate: 10.0,
        }
    }
}

/// Circuit breaker settings, applied per provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Seconds in Open before a recovery probe is allowed.
    pub reset_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 60,
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

/// Deduplicator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// How long a completed result stays cached, in seconds.
    pub result_ttl_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { result_ttl_secs: 60 }
    }
}

/// Task classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Cache TTL in seconds.
    pub cache_ttl_secs: u64,
    /// Maximum cached classifications before eviction.
    pub cache_max_size: usize,
    /// Budget for one backend call, in milliseconds.
    pub backend_timeout_ms: u64,
    /// Category used when the backend is unavailable.
    pub default_category: TaskCategory,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 3600,
            cache_max_size: 1000,
            backend_timeout_ms: 2000,
            default_category: TaskCategory::Generation,
        }
    }
}

/// Weights for the round-table scoring dimensions. Externally supplied
/// so the scoring model stays configuration, not logic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub relevance: f64,
    pub completeness: f64,
    pub efficiency: f64,
    pub task_alignment: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            relevance: 0.30,
            completeness: 0.30,
            efficiency: 0.20,
            task_alignment: 0.20,
        }
    }
}

/// Tie-break rule when the top two round-table scores are equal and the
/// judge pass is unavailable or undecided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Keep the scorer's ranking order.
    #[default]
    PreferScore,
    /// Prefer the provider with the better priority weight.
    PreferPriority,
    /// Prefer the provider with the lower cost tier.
    PreferCheaper,
}

/// Round-table execution mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundTableConfig {
    /// Minimum successful responses required to declare a winner.
    pub min_responses: usize,
    /// Cap on concurrent participants; 0 = all eligible providers.
    pub max_participants: usize,
    /// Collection window per participant, in milliseconds. The effective
    /// per-call budget is the smaller of this and the provider timeout.
    pub timeout_ms: u64,
    /// Provider used for the judged head-to-head pass between the top
    /// two scorers. Absent disables the judge pass.
    #[serde(default)]
    pub judge_provider: Option<ProviderId>,
    /// Tie-break rule for equal scores.
    #[serde(default)]
    pub tie_break: TieBreak,
    /// Scoring weights.
    #[serde(default)]
    pub weights: ScoreWeights,
    /// Bounded in-memory history of recent round-table results.
    pub history_limit: usize,
}

impl Default for RoundTableConfig {
    fn default() -> Self {
        Self {
            min_responses: 1,
            max_participants: 0,
            timeout_ms: 30_000,
            judge_provider: None,
            tie_break: TieBreak::default(),
            weights: ScoreWeights::default(),
            history_limit: 1000,
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Provider capability table.
    pub providers: Vec<ProviderDescriptor>,
    /// Strategy used when the request does not force a provider.
    pub default_strategy: SelectionStrategy,
    /// Category → technique mapping table.
    pub techniques: TechniqueMap,
    pub limiter: LimiterConfig,
    pub breaker: BreakerConfig,
    pub dedup: DedupConfig,
    pub classifier: ClassifierConfig,
    pub round_table: RoundTableConfig,
}

impl GatewayConfig {
    /// Parse configuration from a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("failed to parse gateway config")
    }

    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn descriptor(&self, id: &ProviderId) -> Option<&ProviderDescriptor> {
        self.providers.iter().find(|d| &d.name == id)
    }
}
