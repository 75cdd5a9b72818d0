//! Fixed window counter.
//!
//! Time is cut into aligned buckets of `window`; each bucket has its own
//! counter. A client can get up to `2 * limit` requests through in a short
//! span straddling a bucket boundary. That is the known cost of this
//! algorithm and is kept as is.

use super::{window_key, window_position, Algorithm, RateLimitAlgorithm, RateLimitDecision};
use crate::clock::{from_unix_millis, unix_millis, Clock};
use crate::error::Result;
use crate::store::KeyStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub struct FixedWindowLimiter {
    store: Arc<dyn KeyStore>,
    clock: Arc<dyn Clock>,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn KeyStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl RateLimitAlgorithm for FixedWindowLimiter {
    async fn allow(
        &self,
        limit_key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<RateLimitDecision> {
        let now = self.clock.now();
        let (index, _, window_ms) = window_position(unix_millis(now), window);
        let reset_at = from_unix_millis((index + 1) * window_ms);

        let key = window_key(Algorithm::Fixed, limit_key, index);
        let count = self.store.increment_with_expiry(&key, 1, window).await?;
        let count = count.max(0) as u64;

        tracing::debug!(limit_key, count, limit, window_index = index, "fixed window check");

        if count <= limit {
            Ok(RateLimitDecision::allowed(limit, limit - count, reset_at))
        } else {
            Ok(RateLimitDecision::denied(limit, reset_at, now))
        }
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Fixed
    }
}
