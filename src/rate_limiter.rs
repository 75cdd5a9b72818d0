use crate::algorithms::{self, Algorithm, RateLimitAlgorithm, RateLimitDecision};
use crate::clock::{from_unix_millis, unix_millis, Clock};
use crate::config::AdmissionSettings;
use crate::error::Result;
use crate::store::KeyStore;
use std::sync::Arc;
use std::time::Duration;

/// Algorithm-agnostic rate limiter.
///
/// Holds the configured default limit and window; the counters themselves
/// live in the store so several instances can share them.
#[derive(Clone)]
pub struct RateLimiter {
    algorithm: Arc<dyn RateLimitAlgorithm>,
    clock: Arc<dyn Clock>,
    limit: u64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(
        algorithm: Arc<dyn RateLimitAlgorithm>,
        clock: Arc<dyn Clock>,
        limit: u64,
        window: Duration,
    ) -> Self {
        Self {
            algorithm,
            clock,
            limit,
            window,
        }
    }

    pub fn from_settings(
        settings: &AdmissionSettings,
        store: Arc<dyn KeyStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let algorithm = algorithms::build(
            settings.algorithm,
            store,
            clock.clone(),
            settings.bucket_capacity,
            settings.refill_rate,
        );
        Self::new(algorithm, clock, settings.limit, settings.window)
    }

    /// Check one request against an explicit limit and window.
    pub async fn allow(
        &self,
        limit_key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<RateLimitDecision> {
        self.algorithm.allow(limit_key, limit, window).await
    }

    /// Check one request against the configured limit and window.
    pub async fn check(&self, limit_key: &str) -> Result<RateLimitDecision> {
        self.allow(limit_key, self.limit, self.window).await
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm.algorithm()
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Decision used when the store is down and the policy is fail-open.
    pub fn fail_open_decision(&self) -> RateLimitDecision {
        RateLimitDecision::allowed(self.limit, self.limit, self.next_window_start())
    }

    /// Decision used when the store is down and the policy is fail-closed.
    ///
    /// Carries no retry hint: the request was not rate limited, the store failed.
    pub fn fail_closed_decision(&self) -> RateLimitDecision {
        RateLimitDecision {
            retry_after: None,
            ..RateLimitDecision::denied(self.limit, self.next_window_start(), self.clock.now())
        }
    }

    fn next_window_start(&self) -> std::time::SystemTime {
        let window_ms = (self.window.as_millis() as u64).max(1);
        let now_ms = unix_millis(self.clock.now());
        from_unix_millis((now_ms / window_ms + 1) * window_ms)
    }
}
