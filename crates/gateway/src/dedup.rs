//! Concurrent request deduplication.
//!
//! Collapses concurrent, semantically identical requests into a single
//! execution shared by all callers. The first caller for a canonical key
//! runs the work; everyone else attaches to a watch channel and observes
//! the exact same outcome, value or error. Completed successful results
//! stay cached under the key for a short TTL so rapid repeats skip
//! re-execution even after the original finishes.
//!
//! The map lock is held only to check or insert an entry, never across
//! the work itself. If the originating task is canceled mid-flight, a
//! drop guard removes the entry and attached waiters receive an explicit
//! cancellation error instead of hanging.

use std::cell::Cell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::config::DedupConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::request::Request;

/// How a deduplicated outcome was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupSource {
    /// This caller executed the work.
    Executed,
    /// This caller attached to a concurrent identical in-flight request.
    Attached,
    /// Served from the completed-result cache.
    Cached,
}

type SharedOutcome<T> = Option<GatewayResult<T>>;

struct InFlightEntry<T> {
    rx: watch::Receiver<SharedOutcome<T>>,
    created_at: Instant,
}

struct CachedEntry<T> {
    value: T,
    completed_at: Instant,
}

struct Tables<T> {
    in_flight: HashMap<String, InFlightEntry<T>>,
    completed: HashMap<String, CachedEntry<T>>,
}

/// Deduplicator diagnostics for the health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupStats {
    pub in_flight: usize,
    /// Age of the oldest in-flight entry, in milliseconds.
    pub oldest_in_flight_ms: Option<u64>,
    pub cached_results: usize,
}

/// Single-flight deduplicator over clonable outcomes.
pub struct Deduplicator<T> {
    tables: Mutex<Tables<T>>,
    result_ttl: Duration,
}

impl<T: Clone + Send + Sync + 'static> Deduplicator<T> {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            tables: Mutex::new(Tables {
                in_flight: HashMap::new(),
                completed: HashMap::new(),
            }),
            result_ttl: Duration::from_secs(config.result_ttl_secs),
        }
    }

    /// Run `work` exactly once per canonical key across concurrent callers.
    ///
    /// Returns the outcome and how it was obtained. Shared error outcomes
    /// are wrapped as [`GatewayError::DeduplicationPropagated`] so callers
    /// can tell the failure was not unique to their call.
    pub async fn execute_once<F>(&self, key: &str, work: F) -> (GatewayResult<T>, DedupSource)
    where
        F: Future<Output = GatewayResult<T>>,
    {
        enum Role<T> {
            Leader(watch::Sender<SharedOutcome<T>>),
            Follower(watch::Receiver<SharedOutcome<T>>),
        }

        let role = {
            let mut tables = self.tables.lock().expect("dedup lock");
            Self::purge_expired(&mut tables, self.result_ttl);

            if let Some(cached) = tables.completed.get(key) {
                debug!(key, "dedup cache hit");
                return (Ok(cached.value.clone()), DedupSource::Cached);
            }

            if let Some(entry) = tables.in_flight.get(key) {
                debug!(key, "attaching to in-flight request");
                Role::Follower(entry.rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                tables.in_flight.insert(
                    key.to_string(),
                    InFlightEntry {
                        rx,
                        created_at: Instant::now(),
                    },
                );
                Role::Leader(tx)
            }
        };

        match role {
            Role::Follower(mut rx) => match rx.wait_for(|outcome| outcome.is_some()).await {
                Ok(outcome) => match outcome.clone() {
                    Some(Ok(value)) => (Ok(value), DedupSource::Attached),
                    Some(Err(e)) => (Err(e.propagated()), DedupSource::Attached),
                    // wait_for only returns on Some; defensive arm for the type.
                    None => (Err(GatewayError::DeduplicationCanceled), DedupSource::Attached),
                },
                // Sender dropped without publishing: the originator was canceled.
                Err(_) => (
                    Err(GatewayError::DeduplicationCanceled),
                    DedupSource::Attached,
                ),
            },
            Role::Leader(tx) => {
                let guard = CancelGuard {
                    dedup: self,
                    key,
                    armed: Cell::new(true),
                };

                let outcome = work.await;
                guard.armed.set(false);

                {
                    let mut tables = self.tables.lock().expect("dedup lock");
                    tables.in_flight.remove(key);
                    if let Ok(ref value) = outcome {
                        tables.completed.insert(
                            key.to_string(),
                            CachedEntry {
                                value: value.clone(),
                                completed_at: Instant::now(),
                            },
                        );
                    }
                }

                let _ = tx.send(Some(outcome.clone()));
                (outcome, DedupSource::Executed)
            }
        }
    }

    /// Remove one cached/in-flight key (admin operation).
    pub fn evict(&self, key: &str) {
        let mut tables = self.tables.lock().expect("dedup lock");
        tables.completed.remove(key);
    }

    pub fn stats(&self) -> DedupStats {
        let mut tables = self.tables.lock().expect("dedup lock");
        Self::purge_expired(&mut tables, self.result_ttl);
        DedupStats {
            in_flight: tables.in_flight.len(),
            oldest_in_flight_ms: tables
                .in_flight
                .values()
                .map(|e| e.created_at.elapsed().as_millis() as u64)
                .max(),
            cached_results: tables.completed.len(),
        }
    }

    fn purge_expired(tables: &mut Tables<T>, ttl: Duration) {
        tables
            .completed
            .retain(|_, entry| entry.completed_at.elapsed() < ttl);
    }
}

/// Removes the in-flight entry when the leader is dropped before
/// publishing, so waiters fail fast and later callers re-execute.
struct CancelGuard<'a, T> {
    dedup: &'a Deduplicator<T>,
    key: &'a str,
    armed: Cell<bool>,
}

impl<T> Drop for CancelGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed.get() {
            if let Ok(mut tables) = self.dedup.tables.lock() {
                tables.in_flight.remove(self.key);
            }
        }
    }
}

/// Canonical deduplication key for a request.
///
/// Serializes the logically relevant fields into a sorted-key JSON
/// document and hashes it, so two requests that differ only in field
/// ordering or construction path produce the same key. Caller identity
/// and correlation id are deliberately excluded.
pub fn canonical_key(request: &Request) -> String {
    let messages: Vec<serde_json::Value> = request
        .messages
        .iter()
        .map(|m| json!({ "role": m.role, "content": m.content }))
        .collect();

    // serde_json maps are BTree-backed, so key order is canonical here.
    let value = json!({
        "messages": messages,
        "task_hint": request.task_hint,
        "forced_provider": request.forced_provider,
        "forced_technique": request.forced_technique,
        "temperature_milli": (request.temperature * 1000.0).round() as i64,
        "max_tokens": request.max_tokens,
        "mode": request.mode,
    });

    let serialized = serde_json::to_vec(&value).unwrap_or_default();
    blake3::hash(&serialized).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ExecutionMode, Message};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn dedup() -> Arc<Deduplicator<String>> {
        Arc::new(Deduplicator::new(DedupConfig::default()))
    }

    #[tokio::test]
    async fn test_single_request_executes() {
        let dedup = dedup();
        let (result, source) = dedup
            .execute_once("k1", async { Ok("value".to_string()) })
            .await;
        assert_eq!(result.unwrap(), "value");
        assert_eq!(source, DedupSource::Executed);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let dedup = dedup();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let dedup = dedup.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                dedup
                    .execute_once("k1", async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok("shared".to_string())
                    })
                    .await
            }));
        }

        let mut executed = 0;
        for handle in handles {
            let (result, source) = handle.await.unwrap();
            assert_eq!(result.unwrap(), "shared");
            if source == DedupSource::Executed {
                executed += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(executed, 1);
    }

    #[tokio::test]
    async fn test_error_outcome_propagates_tagged() {
        let dedup = dedup();

        let leader = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .execute_once("k1", async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(GatewayError::AllProvidersExhausted { attempted: 2 })
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let (follower_result, source) = dedup
            .execute_once("k1", async { Ok("never runs".to_string()) })
            .await;

        let (leader_result, _) = leader.await.unwrap();
        assert!(matches!(
            leader_result,
            Err(GatewayError::AllProvidersExhausted { attempted: 2 })
        ));
        assert_eq!(source, DedupSource::Attached);
        match follower_result {
            Err(GatewayError::DeduplicationPropagated { source }) => {
                assert!(matches!(
                    *source,
                    GatewayError::AllProvidersExhausted { attempted: 2 }
                ));
            }
            other => panic!("expected propagated error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_completed_result_cached_within_ttl() {
        let dedup = dedup();
        let calls = Arc::new(AtomicUsize::new(0));

        for expected in [DedupSource::Executed, DedupSource::Cached] {
            let calls = calls.clone();
            let (result, source) = dedup
                .execute_once("k1", async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("cached".to_string())
                })
                .await;
            assert_eq!(result.unwrap(), "cached");
            assert_eq!(source, expected);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_after_ttl() {
        let dedup = Arc::new(Deduplicator::<String>::new(DedupConfig {
            result_ttl_secs: 60,
        }));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            dedup
                .execute_once("k1", async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("v".to_string())
                })
                .await
                .0
                .unwrap();
            tokio::time::advance(Duration::from_secs(61)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let dedup = dedup();

        let (first, _) = dedup
            .execute_once("k1", async {
                Err(GatewayError::AllProvidersExhausted { attempted: 1 })
            })
            .await;
        assert!(first.is_err());

        // A later caller re-executes rather than receiving the old error.
        let (second, source) = dedup
            .execute_once("k1", async { Ok("recovered".to_string()) })
            .await;
        assert_eq!(second.unwrap(), "recovered");
        assert_eq!(source, DedupSource::Executed);
    }

    #[tokio::test]
    async fn test_canceled_leader_yields_defined_outcome_for_waiters() {
        let dedup = dedup();

        let leader = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .execute_once("k1", async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok("never".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiter = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .execute_once("k1", async { Ok("not me".to_string()) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        let (result, source) = waiter.await.unwrap();
        assert!(matches!(result, Err(GatewayError::DeduplicationCanceled)));
        assert_eq!(source, DedupSource::Attached);

        // The key is free again for fresh executions.
        let (retry, source) = dedup
            .execute_once("k1", async { Ok("fresh".to_string()) })
            .await;
        assert_eq!(retry.unwrap(), "fresh");
        assert_eq!(source, DedupSource::Executed);
    }

    #[tokio::test]
    async fn test_stats_reflect_in_flight_entries() {
        let dedup = dedup();

        let leader = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .execute_once("slow", async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("done".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = dedup.stats();
        assert_eq!(stats.in_flight, 1);
        assert!(stats.oldest_in_flight_ms.is_some());

        leader.await.unwrap().0.unwrap();
        let stats = dedup.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.cached_results, 1);
    }

    #[test]
    fn test_canonical_key_is_stable_for_equivalent_requests() {
        let a = Request::new(vec![Message::user("hello")])
            .with_max_tokens(256)
            .with_temperature(0.5);
        let b = Request::new(vec![Message::user("hello")])
            .with_temperature(0.5)
            .with_max_tokens(256);
        assert_eq!(canonical_key(&a), canonical_key(&b));
    }

    #[test]
    fn test_canonical_key_ignores_caller_and_correlation() {
        let a = Request::new(vec![Message::user("hello")]).with_caller("alice");
        let b = Request::new(vec![Message::user("hello")]).with_caller("bob");
        assert_eq!(canonical_key(&a), canonical_key(&b));
    }

    #[test]
    fn test_canonical_key_varies_with_semantics() {
        let base = Request::new(vec![Message::user("hello")]);
        let hotter = Request::new(vec![Message::user("hello")]).with_temperature(1.2);
        let other_mode =
            Request::new(vec![Message::user("hello")]).with_mode(ExecutionMode::RoundTable);

        assert_ne!(canonical_key(&base), canonical_key(&hotter));
        assert_ne!(canonical_key(&base), canonical_key(&other_mode));
    }
}
