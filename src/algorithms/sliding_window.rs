//! Sliding window rate limiting algorithm
//!
//! Approximates a window that moves with time using the counters of the
//! current and the previous fixed window:
//!
//! ```text
//! effective = current + floor(previous * (1 - elapsed / window))
//! ```
//!
//! The previous window's contribution is truncated to whole requests.

use super::{window_key, window_position, Algorithm, RateLimitAlgorithm, RateLimitDecision};
use crate::clock::{from_unix_millis, unix_millis, Clock};
use crate::error::Result;
use crate::store::{decode_counter, KeyStore};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Sliding window rate limiter implementation
pub struct SlidingWindowLimiter {
    store: Arc<dyn KeyStore>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    /// Create a new sliding window rate limiter
    pub fn new(store: Arc<dyn KeyStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    async fn previous_count(&self, limit_key: &str, index: u64) -> Result<u64> {
        if index == 0 {
            return Ok(0);
        }
        let key = window_key(Algorithm::Sliding, limit_key, index - 1);
        match self.store.get(&key).await? {
            Some(value) => Ok(decode_counter(&value)?.max(0) as u64),
            None => Ok(0),
        }
    }
}

/// `floor(previous * (window_ms - elapsed_ms) / window_ms)` without floating point.
fn weighted_previous(previous: u64, elapsed_ms: u64, window_ms: u64) -> u64 {
    let remaining_ms = window_ms.saturating_sub(elapsed_ms) as u128;
    ((previous as u128 * remaining_ms) / window_ms as u128) as u64
}

#[async_trait]
impl RateLimitAlgorithm for SlidingWindowLimiter {
    async fn allow(
        &self,
        limit_key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<RateLimitDecision> {
        let now = self.clock.now();
        let (index, elapsed_ms, window_ms) = window_position(unix_millis(now), window);
        let reset_at = from_unix_millis((index + 1) * window_ms);

        // The current counter is read back as "previous" during the next window.
        let current_key = window_key(Algorithm::Sliding, limit_key, index);
        let current = self
            .store
            .increment_with_expiry(&current_key, 1, window * 2)
            .await?
            .max(0) as u64;
        let previous = self.previous_count(limit_key, index).await?;

        let effective = current + weighted_previous(previous, elapsed_ms, window_ms);

        tracing::debug!(
            limit_key,
            current,
            previous,
            effective,
            limit,
            "sliding window check"
        );

        if effective <= limit {
            Ok(RateLimitDecision::allowed(limit, limit - effective, reset_at))
        } else {
            Ok(RateLimitDecision::denied(limit, reset_at, now))
        }
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Sliding
    }
}
