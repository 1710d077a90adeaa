//! Per-provider circuit breaker.
//!
//! Explicit three-state machine with exactly five legal transitions:
//!
//! ```text
//! Closed   --N consecutive failures-->  Open
//! Open     --reset timeout elapsed-->   HalfOpen (one trial permitted)
//! HalfOpen --trial success-->           Closed
//! HalfOpen --trial failure-->           Open (timer restarts)
//! Closed   --success-->                 Closed (failure counter reset)
//! ```
//!
//! A HalfOpen provider admits a single in-flight trial; concurrent
//! requests are refused until that trial resolves.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::provider::ProviderId;

/// Circuit state for a single provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy — requests allowed.
    Closed,
    /// Tripped — requests refused until the reset timeout elapses.
    Open,
    /// Probing — exactly one trial request allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// A state change applied by the breaker, for event publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitTransition {
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug)]
struct Entry {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    probe_started: Option<Instant>,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            opened_at: None,
            probe_in_flight: false,
            probe_started: None,
        }
    }
}

/// Breaker state snapshot for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub provider: ProviderId,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Milliseconds since the last recorded failure, if any.
    pub last_failure_age_ms: Option<u64>,
}

/// Per-provider circuit breaker table. Entries are created lazily on
/// first use and live for the process lifetime.
pub struct CircuitBreaker {
    entries: Mutex<HashMap<ProviderId, Entry>>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            failure_threshold: config.failure_threshold,
            reset_timeout: config.reset_timeout(),
        }
    }

    /// Whether a request could currently be routed to `provider`.
    ///
    /// Non-mutating view used for candidate filtering: Open circuits whose
    /// reset timeout has elapsed count as available because the next
    /// [`CircuitBreaker::try_acquire`] will admit the recovery probe.
    pub fn is_available(&self, provider: &ProviderId) -> bool {
        let entries = self.entries.lock().expect("breaker lock");
        match entries.get(provider) {
            None => true,
            Some(entry) => match entry.state {
                CircuitState::Closed => true,
                CircuitState::HalfOpen => {
                    !entry.probe_in_flight
                        || entry
                            .probe_started
                            .map(|at| at.elapsed() >= self.reset_timeout)
                            .unwrap_or(true)
                }
                CircuitState::Open => self.reset_elapsed(entry),
            },
        }
    }

    /// Admit or refuse an invocation attempt.
    ///
    /// Applies the Open → HalfOpen transition when the reset timeout has
    /// elapsed and claims the single HalfOpen probe slot. Returns the
    /// transition applied, if any, alongside the admission decision.
    pub fn try_acquire(&self, provider: &ProviderId) -> (bool, Option<CircuitTransition>) {
        let mut entries = self.entries.lock().expect("breaker lock");
        let entry = entries.entry(provider.clone()).or_insert_with(Entry::new);

        match entry.state {
            CircuitState::Closed => (true, None),
            CircuitState::HalfOpen => {
                // A probe whose caller was canceled and never reported back
                // is reclaimed after the reset timeout.
                let probe_stale = entry
                    .probe_started
                    .map(|at| at.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if entry.probe_in_flight && !probe_stale {
                    (false, None)
                } else {
                    entry.probe_in_flight = true;
                    entry.probe_started = Some(Instant::now());
                    (true, None)
                }
            }
            CircuitState::Open => {
                let elapsed = entry
                    .opened_at
                    .map(|at| at.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    entry.state = CircuitState::HalfOpen;
                    entry.probe_in_flight = true;
                    entry.probe_started = Some(Instant::now());
                    info!(provider = %provider, "circuit open -> half_open (recovery probe)");
                    (
                        true,
                        Some(CircuitTransition {
                            from: CircuitState::Open,
                            to: CircuitState::HalfOpen,
                        }),
                    )
                } else {
                    (false, None)
                }
            }
        }
    }

    /// Record a successful invocation.
    pub fn record_success(&self, provider: &ProviderId) -> Option<CircuitTransition> {
        let mut entries = self.entries.lock().expect("breaker lock");
        let entry = entries.entry(provider.clone()).or_insert_with(Entry::new);

        match entry.state {
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Closed;
                entry.consecutive_failures = 0;
                entry.opened_at = None;
                entry.probe_in_flight = false;
                entry.probe_started = None;
                info!(provider = %provider, "circuit half_open -> closed (recovered)");
                Some(CircuitTransition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Closed,
                })
            }
            CircuitState::Closed => {
                entry.consecutive_failures = 0;
                None
            }
            // Success while Open is not a legal transition source; the
            // call must have been admitted before the circuit tripped.
            CircuitState::Open => None,
        }
    }

    /// Record a failed invocation (errors and timeouts alike).
    pub fn record_failure(&self, provider: &ProviderId) -> Option<CircuitTransition> {
        let mut entries = self.entries.lock().expect("breaker lock");
        let entry = entries.entry(provider.clone()).or_insert_with(Entry::new);
        let now = Instant::now();
        entry.last_failure = Some(now);

        match entry.state {
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(now);
                entry.probe_in_flight = false;
                entry.probe_started = None;
                warn!(provider = %provider, "circuit half_open -> open (probe failed)");
                Some(CircuitTransition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Open,
                })
            }
            CircuitState::Closed => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.failure_threshold {
                    entry.state = CircuitState::Open;
                    entry.opened_at = Some(now);
                    warn!(
                        provider = %provider,
                        failures = entry.consecutive_failures,
                        "circuit closed -> open"
                    );
                    Some(CircuitTransition {
                        from: CircuitState::Closed,
                        to: CircuitState::Open,
                    })
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    /// Current state for a provider. Open circuits whose reset timeout
    /// has elapsed report HalfOpen, matching what the next acquire does.
    pub fn state(&self, provider: &ProviderId) -> CircuitState {
        let entries = self.entries.lock().expect("breaker lock");
        match entries.get(provider) {
            None => CircuitState::Closed,
            Some(entry) => match entry.state {
                CircuitState::Open if self.reset_elapsed(entry) => CircuitState::HalfOpen,
                state => state,
            },
        }
    }

    /// Manually reset a provider's circuit to Closed (ops recovery).
    pub fn reset(&self, provider: &ProviderId) {
        let mut entries = self.entries.lock().expect("breaker lock");
        entries.insert(provider.clone(), Entry::new());
        info!(provider = %provider, "circuit manually reset to closed");
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let entries = self.entries.lock().expect("breaker lock");
        let mut out: Vec<BreakerSnapshot> = entries
            .iter()
            .map(|(provider, entry)| BreakerSnapshot {
                provider: provider.clone(),
                state: match entry.state {
                    CircuitState::Open if self.reset_elapsed(entry) => CircuitState::HalfOpen,
                    state => state,
                },
                consecutive_failures: entry.consecutive_failures,
                last_failure_age_ms: entry
                    .last_failure
                    .map(|at| at.elapsed().as_millis() as u64),
            })
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }

    fn reset_elapsed(&self, entry: &Entry) -> bool {
        entry
            .opened_at
            .map(|at| at.elapsed() >= self.reset_timeout)
            .unwrap_or(true)
    }
}
