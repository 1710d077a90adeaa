//! Provider routing — strategy-ranked, breaker-filtered candidate lists.
//!
//! The router turns a task classification (or an explicit forced
//! provider) into an ordered list of providers to try. Providers whose
//! circuit is open are excluded; an empty list is a normal outcome the
//! coordinator handles, not an error.

pub mod circuit_breaker;

pub use circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitState, CircuitTransition,
};

use std::cmp::Reverse;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classifier::TaskCategory;
use crate::config::ProviderDescriptor;
use crate::error::{GatewayError, GatewayResult};
use crate::provider::{ProviderId, ProviderRegistry};

/// Strategy used to order eligible providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Order by configured priority weight.
    #[default]
    Priority,
    /// Favor cheaper cost tiers.
    Cost,
    /// Favor historically faster providers.
    Latency,
    /// Rotate through eligible providers evenly.
    RoundRobin,
}

impl std::fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Priority => write!(f, "priority"),
            Self::Cost => write!(f, "cost"),
            Self::Latency => write!(f, "latency"),
            Self::RoundRobin => write!(f, "round_robin"),
        }
    }
}

/// Ranks and filters providers for the execution coordinator.
pub struct ProviderRouter {
    descriptors: Vec<ProviderDescriptor>,
    breaker: Arc<CircuitBreaker>,
    registry: Arc<ProviderRegistry>,
    rr_cursor: AtomicUsize,
}

impl ProviderRouter {
    pub fn new(
        descriptors: Vec<ProviderDescriptor>,
        breaker: Arc<CircuitBreaker>,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            descriptors,
            breaker,
            registry,
            rr_cursor: AtomicUsize::new(0),
        }
    }

    /// Ordered candidate list for a category under the given strategy.
    ///
    /// Excludes providers with zero strength for the category and
    /// providers whose circuit is open. An empty result means every
    /// eligible provider is currently unavailable.
    pub fn candidates(
        &self,
        category: TaskCategory,
        strategy: SelectionStrategy,
    ) -> Vec<ProviderId> {
        let mut eligible: Vec<&ProviderDescriptor> = self
            .descriptors
            .iter()
            .filter(|d| d.strength_for(category) > 0)
            .filter(|d| self.breaker.is_available(&d.name))
            .collect();

        match strategy {
            SelectionStrategy::Priority => {
                eligible.sort_by_key(|d| {
                    (
                        d.priority,
                        Reverse(d.strength_for(category)),
                        d.name.clone(),
                    )
                });
            }
            SelectionStrategy::Cost => {
                eligible.sort_by_key(|d| {
                    (
                        d.cost_tier,
                        Reverse(d.strength_for(category)),
                        d.name.clone(),
                    )
                });
            }
            SelectionStrategy::Latency => {
                // Providers with no history sort first so cold providers
                // still get traffic; ties fall back to strength.
                eligible.sort_by_key(|d| {
                    (
                        self.registry.avg_latency_ms(&d.name).unwrap_or(0),
                        Reverse(d.strength_for(category)),
                        d.name.clone(),
                    )
                });
            }
            SelectionStrategy::RoundRobin => {
                eligible.sort_by_key(|d| d.name.clone());
                if !eligible.is_empty() {
                    let offset = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
                    eligible.rotate_left(offset);
                }
            }
        }

        let candidates: Vec<ProviderId> = eligible.iter().map(|d| d.name.clone()).collect();
        debug!(
            category = %category,
            strategy = %strategy,
            count = candidates.len(),
            "routed candidates"
        );
        candidates
    }

    /// Candidate list for an explicitly forced provider.
    ///
    /// Unknown providers are a request error; a known provider with an
    /// open circuit yields an empty list, same as an exhausted category.
    pub fn forced(&self, provider: &ProviderId) -> GatewayResult<Vec<ProviderId>> {
        if !self.descriptors.iter().any(|d| &d.name == provider) {
            return Err(GatewayError::InvalidRequest {
                reason: format!("unknown provider: {provider}"),
            });
        }
        if self.breaker.is_available(provider) {
            Ok(vec![provider.clone()])
        } else {
            Ok(Vec::new())
        }
    }

    pub fn descriptor(&self, provider: &ProviderId) -> Option<&ProviderDescriptor> {
        self.descriptors.iter().find(|d| &d.name == provider)
    }

    pub fn descriptors(&self) -> &[ProviderDescriptor] {
        &self.descriptors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;

    fn router_with(descriptors: Vec<ProviderDescriptor>) -> ProviderRouter {
        ProviderRouter::new(
            descriptors,
            Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            Arc::new(ProviderRegistry::new()),
        )
    }

    fn three_providers() -> Vec<ProviderDescriptor> {
        vec![
            ProviderDescriptor::new("alpha")
                .with_priority(2)
                .with_cost_tier(3)
                .with_strength(TaskCategory::Code, 9),
            ProviderDescriptor::new("beta")
                .with_priority(1)
                .with_cost_tier(2)
                .with_strength(TaskCategory::Code, 7),
            ProviderDescriptor::new("gamma")
                .with_priority(3)
                .with_cost_tier(1)
                .with_strength(TaskCategory::Code, 5),
        ]
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let router = router_with(three_providers());
        let candidates = router.candidates(TaskCategory::Code, SelectionStrategy::Priority);
        let names: Vec<&str> = candidates.iter().map(|p| p.as_str()).collect();
        assert_eq!(names, vec!["beta", "alpha", "gamma"]);
    }

    #[tokio::test]
    async fn test_cost_ordering() {
        let router = router_with(three_providers());
        let candidates = router.candidates(TaskCategory::Code, SelectionStrategy::Cost);
        let names: Vec<&str> = candidates.iter().map(|p| p.as_str()).collect();
        assert_eq!(names, vec!["gamma", "beta", "alpha"]);
    }

    #[tokio::test]
    async fn test_latency_ordering_uses_history() {
        let registry = Arc::new(ProviderRegistry::new());
        registry.record_success(&ProviderId::from("alpha"), 900);
        registry.record_success(&ProviderId::from("beta"), 100);
        registry.record_success(&ProviderId::from("gamma"), 400);

        let router = ProviderRouter::new(
            three_providers(),
            Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            registry,
        );
        let candidates = router.candidates(TaskCategory::Code, SelectionStrategy::Latency);
        let names: Vec<&str> = candidates.iter().map(|p| p.as_str()).collect();
        assert_eq!(names, vec!["beta", "gamma", "alpha"]);
    }

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let router = router_with(three_providers());

        let first = router.candidates(TaskCategory::Code, SelectionStrategy::RoundRobin);
        let second = router.candidates(TaskCategory::Code, SelectionStrategy::RoundRobin);
        let third = router.candidates(TaskCategory::Code, SelectionStrategy::RoundRobin);
        let fourth = router.candidates(TaskCategory::Code, SelectionStrategy::RoundRobin);

        assert_eq!(first[0].as_str(), "alpha");
        assert_eq!(second[0].as_str(), "beta");
        assert_eq!(third[0].as_str(), "gamma");
        // Cycles back around.
        assert_eq!(fourth[0].as_str(), "alpha");
        assert_eq!(first.len(), 3);
    }

    #[tokio::test]
    async fn test_open_breaker_excluded() {
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            reset_timeout_secs: 9999,
        }));
        breaker.record_failure(&ProviderId::from("beta"));

        let router = ProviderRouter::new(
            three_providers(),
            breaker,
            Arc::new(ProviderRegistry::new()),
        );
        let candidates = router.candidates(TaskCategory::Code, SelectionStrategy::Priority);
        let names: Vec<&str> = candidates.iter().map(|p| p.as_str()).collect();
        assert_eq!(names, vec!["alpha", "gamma"]);
    }

    #[tokio::test]
    async fn test_all_open_yields_empty_list() {
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            reset_timeout_secs: 9999,
        }));
        for name in ["alpha", "beta", "gamma"] {
            breaker.record_failure(&ProviderId::from(name));
        }

        let router = ProviderRouter::new(
            three_providers(),
            breaker,
            Arc::new(ProviderRegistry::new()),
        );
        assert!(router
            .candidates(TaskCategory::Code, SelectionStrategy::Priority)
            .is_empty());
    }

    #[tokio::test]
    async fn test_zero_strength_excluded() {
        let descriptors = vec![
            ProviderDescriptor::new("coder").with_strength(TaskCategory::Creative, 0),
            ProviderDescriptor::new("poet").with_strength(TaskCategory::Creative, 8),
        ];
        let router = router_with(descriptors);
        let candidates = router.candidates(TaskCategory::Creative, SelectionStrategy::Priority);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].as_str(), "poet");
    }

    #[tokio::test]
    async fn test_forced_provider() {
        let router = router_with(three_providers());

        let forced = router.forced(&ProviderId::from("beta")).unwrap();
        assert_eq!(forced.len(), 1);

        let unknown = router.forced(&ProviderId::from("nope"));
        assert!(matches!(
            unknown,
            Err(GatewayError::InvalidRequest { .. })
        ));
    }

    #[tokio::test]
    async fn test_forced_provider_with_open_breaker_is_empty() {
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            reset_timeout_secs: 9999,
        }));
        breaker.record_failure(&ProviderId::from("beta"));

        let router = ProviderRouter::new(
            three_providers(),
            breaker,
            Arc::new(ProviderRegistry::new()),
        );
        assert!(router.forced(&ProviderId::from("beta")).unwrap().is_empty());
    }
}
