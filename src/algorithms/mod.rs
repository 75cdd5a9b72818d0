//! Rate limiting algorithms module
//!
//! Three interchangeable algorithms share the [`RateLimitAlgorithm`] trait so
//! callers never depend on which one is configured. All state lives in the
//! [`KeyStore`]; the algorithms keep nothing between calls.

mod fixed_window;
mod sliding_window;
mod token_bucket;

pub use fixed_window::FixedWindowLimiter;
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::{TokenBucketLimiter, TokenBucketState};

use crate::clock::Clock;
use crate::error::Result;
use crate::store::KeyStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Which algorithm a [`crate::rate_limiter::RateLimiter`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    #[default]
    #[serde(alias = "fixed-window")]
    Fixed,
    #[serde(alias = "sliding-window")]
    Sliding,
    TokenBucket,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Fixed => "fixed",
            Algorithm::Sliding => "sliding",
            Algorithm::TokenBucket => "token-bucket",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: SystemTime,
    /// How long a denied caller should wait. `None` when allowed.
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    pub fn allowed(limit: u64, remaining: u64, reset_at: SystemTime) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_at,
            retry_after: None,
        }
    }

    pub fn denied(limit: u64, reset_at: SystemTime, now: SystemTime) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at,
            retry_after: Some(reset_at.duration_since(now).unwrap_or_default()),
        }
    }
}

/// Trait for rate limiting algorithms
#[async_trait]
pub trait RateLimitAlgorithm: Send + Sync {
    /// Records one request for `limit_key` and decides whether it may proceed.
    ///
    /// Never blocks beyond the store round trips it needs.
    async fn allow(&self, limit_key: &str, limit: u64, window: Duration)
        -> Result<RateLimitDecision>;

    fn algorithm(&self) -> Algorithm;
}

/// Builds the configured algorithm over a shared store and clock.
pub fn build(
    algorithm: Algorithm,
    store: Arc<dyn KeyStore>,
    clock: Arc<dyn Clock>,
    bucket_capacity: u64,
    refill_rate: f64,
) -> Arc<dyn RateLimitAlgorithm> {
    match algorithm {
        Algorithm::Fixed => Arc::new(FixedWindowLimiter::new(store, clock)),
        Algorithm::Sliding => Arc::new(SlidingWindowLimiter::new(store, clock)),
        Algorithm::TokenBucket => Arc::new(TokenBucketLimiter::new(
            store,
            clock,
            bucket_capacity,
            refill_rate,
        )),
    }
}

/// Store key for a windowed counter: `ratelimit:{algorithm}:{limit_key}:{window_index}`.
pub(crate) fn window_key(algorithm: Algorithm, limit_key: &str, window_index: u64) -> String {
    format!("ratelimit:{}:{}:{}", algorithm, limit_key, window_index)
}

/// Splits `now` into the index of its window and the milliseconds elapsed inside it.
pub(crate) fn window_position(now_ms: u64, window: Duration) -> (u64, u64, u64) {
    let window_ms = (window.as_millis() as u64).max(1);
    (now_ms / window_ms, now_ms % window_ms, window_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_serde_names() {
        let parsed: Algorithm = serde_json::from_str("\"token-bucket\"").unwrap();
        assert_eq!(parsed, Algorithm::TokenBucket);
        let parsed: Algorithm = serde_json::from_str("\"sliding-window\"").unwrap();
        assert_eq!(parsed, Algorithm::Sliding);
        assert_eq!(serde_json::to_string(&Algorithm::Fixed).unwrap(), "\"fixed\"");
    }

    #[test]
    fn test_window_position() {
        let (index, elapsed, window_ms) = window_position(125_500, Duration::from_secs(60));
        assert_eq!(index, 2);
        assert_eq!(elapsed, 5_500);
        assert_eq!(window_ms, 60_000);
    }

    #[test]
    fn test_window_key_layout() {
        assert_eq!(
            window_key(Algorithm::Fixed, "ip:10.0.0.1", 7),
            "ratelimit:fixed:ip:10.0.0.1:7"
        );
    }
}
