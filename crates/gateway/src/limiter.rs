//! Per-key token-bucket rate limiting.
//!
//! Each `(caller, endpoint)` key owns a bucket that refills continuously
//! at `refill_rate` tokens per second up to `capacity`. Every consume
//! first applies the elapsed refill, then attempts the deduction, all
//! under one lock — two concurrent consumers can never both succeed when
//! only one unit of capacity remains.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::config::LimiterConfig;

/// Outcome of a single consume attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateDecision {
    pub allowed: bool,
    /// Seconds until enough tokens will have refilled. Zero when allowed.
    pub retry_after_seconds: f64,
    /// Tokens remaining after this decision.
    pub remaining: f64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-key bucket utilization for the health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketStats {
    pub key: String,
    pub tokens_available: f64,
    pub capacity: f64,
    pub refill_rate: f64,
    /// Fraction of capacity currently consumed, 0.0–1.0.
    pub utilization: f64,
}

/// Token-bucket rate limiter keyed by caller/endpoint strings.
///
/// Buckets are created lazily on first use and live for the process
/// lifetime (or until [`RateLimiter::reset`]).
pub struct RateLimiter {
    capacity: f64,
    refill_rate: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Try to consume `tokens` from the bucket for `key`.
    ///
    /// Refills based on elapsed time first, then deducts. Denials report
    /// how long the caller should wait before retrying.
    pub fn consume(&self, key: &str, tokens: f64) -> RateDecision {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock");

        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= tokens {
            bucket.tokens -= tokens;
            RateDecision {
                allowed: true,
                retry_after_seconds: 0.0,
                remaining: bucket.tokens,
            }
        } else {
            let deficit = tokens - bucket.tokens;
            let retry_after = if self.refill_rate > 0.0 {
                deficit / self.refill_rate
            } else {
                f64::INFINITY
            };
            debug!(key, retry_after, "rate limit denial");
            RateDecision {
                allowed: false,
                retry_after_seconds: retry_after,
                remaining: bucket.tokens,
            }
        }
    }

    /// Current token count for a key without consuming, refill applied.
    pub fn tokens_available(&self, key: &str) -> f64 {
        let buckets = self.buckets.lock().expect("rate limiter lock");
        match buckets.get(key) {
            Some(bucket) => {
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                (bucket.tokens + elapsed * self.refill_rate).min(self.capacity)
            }
            None => self.capacity,
        }
    }

    /// Drop the bucket for one key (admin operation).
    pub fn reset(&self, key: &str) {
        self.buckets
            .lock()
            .expect("rate limiter lock")
            .remove(key);
    }

    /// Drop all buckets.
    pub fn reset_all(&self) {
        self.buckets.lock().expect("rate limiter lock").clear();
    }

    /// Utilization stats for every tracked key.
    pub fn stats(&self) -> Vec<BucketStats> {
        let buckets = self.buckets.lock().expect("rate limiter lock");
        let mut out: Vec<BucketStats> = buckets
            .iter()
            .map(|(key, bucket)| {
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                let tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
                BucketStats {
                    key: key.clone(),
                    tokens_available: tokens,
                    capacity: self.capacity,
                    refill_rate: self.refill_rate,
                    utilization: if self.capacity > 0.0 {
                        1.0 - tokens / self.capacity
                    } else {
                        0.0
                    },
                }
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}
