//! Diagnostics snapshot — the gateway's only introspection surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::ClassifierCacheStats;
use crate::dedup::DedupStats;
use crate::limiter::BucketStats;
use crate::provider::ProviderStatsSnapshot;
use crate::router::BreakerSnapshot;

/// Point-in-time view of all gateway shared state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Per-provider circuit breaker state.
    pub breakers: Vec<BreakerSnapshot>,
    /// Per-key rate limit bucket utilization.
    pub rate_limits: Vec<BucketStats>,
    /// In-flight deduplication entries and cached results.
    pub dedup: DedupStats,
    /// Classifier cache hit ratio and size.
    pub classifier_cache: ClassifierCacheStats,
    /// Rolling per-provider call statistics.
    pub providers: Vec<ProviderStatsSnapshot>,
    pub generated_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Whether any provider circuit is currently not closed.
    pub fn has_degraded_providers(&self) -> bool {
        use crate::router::CircuitState;
        self.breakers.iter().any(|b| b.state != CircuitState::Closed)
    }
}
