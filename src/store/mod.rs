//! Atomic key-value storage backing rate limit counters and idempotency records.
//!
//! Every operation is atomic with respect to concurrent callers on the same
//! key, whether they share a process ([`MemoryStore`]) or only a Redis server
//! ([`RedisStore`]). Expired entries are logically absent and are never
//! returned.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Returns the live value for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replaces the value only if the current one equals `expected`.
    ///
    /// `expected == None` means "the key must be absent". Returns whether the
    /// swap happened. The new value expires after `ttl`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new_value: &[u8],
        ttl: Duration,
    ) -> Result<bool>;

    /// Adds `delta` to the counter at `key` and returns the new value.
    ///
    /// A missing counter starts at zero and expires after `ttl_if_new`; an
    /// existing counter keeps its TTL.
    async fn increment_with_expiry(&self, key: &str, delta: i64, ttl_if_new: Duration)
        -> Result<i64>;

    /// Unconditionally writes `value` with a fresh `ttl`.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    fn backend(&self) -> &'static str;
}

/// Parses a counter stored as ASCII decimal.
pub fn decode_counter(value: &[u8]) -> Result<i64> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| {
            crate::error::AdmissionError::CorruptRecord(format!(
                "counter value is not an integer: {:?}",
                String::from_utf8_lossy(value)
            ))
        })
}
