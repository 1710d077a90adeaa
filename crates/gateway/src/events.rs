//! Observability — correlation ids and the structured event stream.
//!
//! Every request is assigned a [`CorrelationId`] at entry (generated when
//! the caller did not supply one) and the id is threaded through every
//! event and tracing log line the request produces. Events fan out on a
//! tokio broadcast channel; publishing with no subscribers is fine and
//! the tracing mirror always fires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::{TaskCategory, Technique};
use crate::provider::ProviderId;
use crate::request::ExecutionMode;
use crate::router::{CircuitState, SelectionStrategy};

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 256;

/// Opaque identifier propagated through all log events of one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Adopt a caller-supplied id.
    pub fn from_value(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Structured events emitted across a request's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    RequestReceived {
        correlation_id: CorrelationId,
        caller: String,
        mode: ExecutionMode,
        timestamp: DateTime<Utc>,
    },
    RateLimitDecision {
        correlation_id: CorrelationId,
        key: String,
        allowed: bool,
        retry_after_seconds: f64,
        timestamp: DateTime<Utc>,
    },
    DedupLookup {
        correlation_id: CorrelationId,
        hit: bool,
        timestamp: DateTime<Utc>,
    },
    ClassificationCompleted {
        correlation_id: CorrelationId,
        category: TaskCategory,
        technique: Technique,
        confidence: f32,
        cached: bool,
        latency_ms: u64,
        timestamp: DateTime<Utc>,
    },
    ProvidersSelected {
        correlation_id: CorrelationId,
        strategy: SelectionStrategy,
        candidates: Vec<ProviderId>,
        timestamp: DateTime<Utc>,
    },
    ProviderCallStarted {
        correlation_id: CorrelationId,
        provider: ProviderId,
        timestamp: DateTime<Utc>,
    },
    ProviderCallCompleted {
        correlation_id: CorrelationId,
        provider: ProviderId,
        success: bool,
        latency_ms: u64,
        timestamp: DateTime<Utc>,
    },
    BreakerTransition {
        provider: ProviderId,
        from: CircuitState,
        to: CircuitState,
        timestamp: DateTime<Utc>,
    },
    RoundTableScored {
        correlation_id: CorrelationId,
        winner: ProviderId,
        participants: usize,
        responses: usize,
        confidence: f64,
        timestamp: DateTime<Utc>,
    },
    RequestCompleted {
        correlation_id: CorrelationId,
        provider: ProviderId,
        total_latency_ms: u64,
        timestamp: DateTime<Utc>,
    },
    RequestFailed {
        correlation_id: CorrelationId,
        reason_code: String,
        timestamp: DateTime<Utc>,
    },
}

impl GatewayEvent {
    /// Machine-readable event type tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RequestReceived { .. } => "request_received",
            Self::RateLimitDecision { .. } => "rate_limit_decision",
            Self::DedupLookup { .. } => "dedup_lookup",
            Self::ClassificationCompleted { .. } => "classification_completed",
            Self::ProvidersSelected { .. } => "providers_selected",
            Self::ProviderCallStarted { .. } => "provider_call_started",
            Self::ProviderCallCompleted { .. } => "provider_call_completed",
            Self::BreakerTransition { .. } => "breaker_transition",
            Self::RoundTableScored { .. } => "round_table_scored",
            Self::RequestCompleted { .. } => "request_completed",
            Self::RequestFailed { .. } => "request_failed",
        }
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            Self::RequestReceived { correlation_id, .. }
            | Self::RateLimitDecision { correlation_id, .. }
            | Self::DedupLookup { correlation_id, .. }
            | Self::ClassificationCompleted { correlation_id, .. }
            | Self::ProvidersSelected { correlation_id, .. }
            | Self::ProviderCallStarted { correlation_id, .. }
            | Self::ProviderCallCompleted { correlation_id, .. }
            | Self::RoundTableScored { correlation_id, .. }
            | Self::RequestCompleted { correlation_id, .. }
            | Self::RequestFailed { correlation_id, .. } => Some(correlation_id),
            Self::BreakerTransition { .. } => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RequestReceived { timestamp, .. }
            | Self::RateLimitDecision { timestamp, .. }
            | Self::DedupLookup { timestamp, .. }
            | Self::ClassificationCompleted { timestamp, .. }
            | Self::ProvidersSelected { timestamp, .. }
            | Self::ProviderCallStarted { timestamp, .. }
            | Self::ProviderCallCompleted { timestamp, .. }
            | Self::BreakerTransition { timestamp, .. }
            | Self::RoundTableScored { timestamp, .. }
            | Self::RequestCompleted { timestamp, .. }
            | Self::RequestFailed { timestamp, .. } => *timestamp,
        }
    }

    /// Mirror the event onto the tracing subscriber.
    fn emit(&self) {
        match self {
            Self::RequestReceived {
                correlation_id,
                caller,
                mode,
                ..
            } => info!(%correlation_id, caller, mode = %mode, "request received"),
            Self::RateLimitDecision {
                correlation_id,
                key,
                allowed,
                retry_after_seconds,
                ..
            } => {
                if *allowed {
                    debug!(%correlation_id, key, "rate limit allowed");
                } else {
                    warn!(%correlation_id, key, retry_after_seconds, "rate limit exceeded");
                }
            }
            Self::DedupLookup {
                correlation_id,
                hit,
                ..
            } => debug!(%correlation_id, hit, "dedup lookup"),
            Self::ClassificationCompleted {
                correlation_id,
                category,
                technique,
                confidence,
                cached,
                latency_ms,
                ..
            } => info!(
                %correlation_id,
                category = %category,
                technique = %technique,
                confidence,
                cached,
                latency_ms,
                "classified"
            ),
            Self::ProvidersSelected {
                correlation_id,
                strategy,
                candidates,
                ..
            } => debug!(
                %correlation_id,
                strategy = %strategy,
                count = candidates.len(),
                "providers selected"
            ),
            Self::ProviderCallStarted {
                correlation_id,
                provider,
                ..
            } => debug!(%correlation_id, provider = %provider, "provider call started"),
            Self::ProviderCallCompleted {
                correlation_id,
                provider,
                success,
                latency_ms,
                ..
            } => info!(
                %correlation_id,
                provider = %provider,
                success,
                latency_ms,
                "provider call completed"
            ),
            Self::BreakerTransition {
                provider, from, to, ..
            } => warn!(provider = %provider, from = %from, to = %to, "breaker transition"),
            Self::RoundTableScored {
                correlation_id,
                winner,
                participants,
                responses,
                confidence,
                ..
            } => info!(
                %correlation_id,
                winner = %winner,
                participants,
                responses,
                confidence,
                "round table scored"
            ),
            Self::RequestCompleted {
                correlation_id,
                provider,
                total_latency_ms,
                ..
            } => info!(
                %correlation_id,
                provider = %provider,
                total_latency_ms,
                "request completed"
            ),
            Self::RequestFailed {
                correlation_id,
                reason_code,
                ..
            } => warn!(%correlation_id, reason_code, "request failed"),
        }
    }
}

/// Install the process-wide tracing subscriber, honoring `RUST_LOG`.
///
/// For binaries and test harnesses embedding the gateway; the library
/// itself never installs a subscriber. Calling it twice is a no-op.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .try_init();
}

/// Shared reference to an [`EventBus`].
pub type SharedEventBus = Arc<EventBus>;

/// Broadcast event bus for gateway observability.
pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers and the tracing mirror.
    /// Having no subscribers is not an error.
    pub fn publish(&self, event: GatewayEvent) {
        event.emit();
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_ids_are_unique() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
        let supplied = CorrelationId::from_value("caller-supplied-1");
        assert_eq!(supplied.as_str(), "caller-supplied-1");
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let id = CorrelationId::new();
        bus.publish(GatewayEvent::RequestReceived {
            correlation_id: id.clone(),
            caller: "tester".into(),
            mode: ExecutionMode::Balanced,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "request_received");
        assert_eq!(event.correlation_id(), Some(&id));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(GatewayEvent::RequestFailed {
            correlation_id: CorrelationId::new(),
            reason_code: "all_providers_exhausted".into(),
            timestamp: Utc::now(),
        });
    }

    #[tokio::test]
    async fn test_multiple_subscribers_see_every_event() {
        let bus = EventBus::new().shared();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(GatewayEvent::BreakerTransition {
            provider: ProviderId::from("alpha"),
            from: CircuitState::Closed,
            to: CircuitState::Open,
            timestamp: Utc::now(),
        });

        assert_eq!(rx1.recv().await.unwrap().event_type(), "breaker_transition");
        assert_eq!(rx2.recv().await.unwrap().event_type(), "breaker_transition");
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = GatewayEvent::DedupLookup {
            correlation_id: CorrelationId::from_value("c1"),
            hit: true,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"dedup_lookup\""));
        assert!(json.contains("\"hit\":true"));
    }
}
