//! Token bucket over the shared store.
//!
//! The bucket state is read, refilled and written back with compare-and-swap,
//! retrying when another caller updated the same bucket in between. A missing
//! bucket is a full one, so the key only needs to live as long as a refill
//! from empty takes.

use super::{Algorithm, RateLimitAlgorithm, RateLimitDecision};
use crate::clock::{from_unix_millis, unix_millis, Clock};
use crate::error::{AdmissionError, Result};
use crate::store::KeyStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const MAX_CAS_ATTEMPTS: usize = 16;
/// Longest a bucket is kept before it is treated as full again.
const MAX_STATE_TTL: Duration = Duration::from_secs(30 * 86_400);

/// Persisted per-key bucket state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketState {
    pub tokens: f64,
    pub last_refill_ms: u64,
}

impl TokenBucketState {
    pub fn full(capacity: u64, now_ms: u64) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill_ms: now_ms,
        }
    }

    /// Adds the tokens earned since the last refill, capped at `capacity`.
    /// `last_refill_ms` moves to `now_ms` whatever the outcome.
    pub fn refill(&mut self, capacity: u64, refill_rate: f64, now_ms: u64) {
        let elapsed_secs = now_ms.saturating_sub(self.last_refill_ms) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed_secs * refill_rate).min(capacity as f64);
        self.last_refill_ms = now_ms;
    }

    pub fn try_consume(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct TokenBucketLimiter {
    store: Arc<dyn KeyStore>,
    clock: Arc<dyn Clock>,
    capacity: u64,
    refill_rate: f64,
}

impl TokenBucketLimiter {
    pub fn new(
        store: Arc<dyn KeyStore>,
        clock: Arc<dyn Clock>,
        capacity: u64,
        refill_rate: f64,
    ) -> Self {
        Self {
            store,
            clock,
            capacity,
            refill_rate,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn bucket_key(limit_key: &str) -> String {
        format!("ratelimit:{}:{}", Algorithm::TokenBucket, limit_key)
    }

    /// Time for an empty bucket to fill up again, clamped to
    /// `[1s, MAX_STATE_TTL]`.
    fn state_ttl(&self) -> Duration {
        let secs = self.capacity as f64 / self.refill_rate;
        if secs.is_nan() || secs <= 0.0 {
            return Duration::from_secs(1);
        }
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_STATE_TTL)
            .clamp(Duration::from_secs(1), MAX_STATE_TTL)
    }

    fn time_until_token(&self, tokens: f64) -> Duration {
        Duration::try_from_secs_f64((1.0 - tokens).max(0.0) / self.refill_rate)
            .unwrap_or(Duration::from_secs(86_400))
    }

    fn decide(&self, state: &TokenBucketState, allowed: bool, now_ms: u64) -> RateLimitDecision {
        let now = from_unix_millis(now_ms);
        let reset_at = now + self.time_until_token(state.tokens);
        if allowed {
            RateLimitDecision::allowed(self.capacity, state.tokens.floor() as u64, reset_at)
        } else {
            RateLimitDecision::denied(self.capacity, reset_at, now)
        }
    }
}

#[async_trait]
impl RateLimitAlgorithm for TokenBucketLimiter {
    /// `limit` and `window` are ignored; the bucket's capacity and refill
    /// rate govern admission.
    async fn allow(
        &self,
        limit_key: &str,
        _limit: u64,
        _window: Duration,
    ) -> Result<RateLimitDecision> {
        let key = Self::bucket_key(limit_key);
        let ttl = self.state_ttl();

        for attempt in 0..MAX_CAS_ATTEMPTS {
            let now_ms = unix_millis(self.clock.now());
            let current = self.store.get(&key).await?;

            let mut state = match &current {
                Some(bytes) => serde_json::from_slice::<TokenBucketState>(bytes)?,
                None => TokenBucketState::full(self.capacity, now_ms),
            };
            state.refill(self.capacity, self.refill_rate, now_ms);
            let allowed = state.try_consume();

            let encoded = serde_json::to_vec(&state)?;
            if self
                .store
                .compare_and_swap(&key, current.as_deref(), &encoded, ttl)
                .await?
            {
                tracing::debug!(
                    limit_key,
                    allowed,
                    tokens = state.tokens,
                    attempt,
                    "token bucket check"
                );
                return Ok(self.decide(&state, allowed, now_ms));
            }
        }

        tracing::warn!(limit_key, "token bucket update lost too many races");
        Err(AdmissionError::StoreContention(key))
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }
}
