use super::KeyStore;
use crate::error::{AdmissionError, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Script};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

/// Compare-and-swap. ARGV[1] is "1" when a current value is expected.
const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then
    return 0
  end
elseif current then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
return 1
"#;

const INCREMENT_WITH_EXPIRY_SCRIPT: &str = r#"
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return value
"#;

/// Networked store for deployments running several service instances.
///
/// Multi-step operations run as Lua scripts so Redis executes them atomically.
/// Clones share one multiplexed connection, opened on first use and replaced
/// after an I/O error.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: Arc<RwLock<Option<MultiplexedConnection>>>,
    compare_and_swap: Script,
    increment_with_expiry: Script,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            AdmissionError::StoreUnavailable(format!("Failed to create Redis client: {}", e))
        })?;

        Ok(Self {
            client,
            conn: Arc::new(RwLock::new(None)),
            compare_and_swap: Script::new(COMPARE_AND_SWAP_SCRIPT),
            increment_with_expiry: Script::new(INCREMENT_WITH_EXPIRY_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.conn.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let mut slot = self.conn.write().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AdmissionError::StoreUnavailable(format!("Failed to connect to Redis: {}", e)))?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Maps a command result, dropping the shared connection if it broke.
    async fn checked<T>(&self, command: &str, result: redis::RedisResult<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                if is_broken_connection(&e) {
                    warn!(command, error = %e, "dropping broken Redis connection");
                    *self.conn.write().await = None;
                }
                Err(AdmissionError::StoreUnavailable(format!("{} failed: {}", command, e)))
            }
        }
    }
}

fn is_broken_connection(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal()
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KeyStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        let result = redis::cmd("GET").arg(key).query_async(&mut conn).await;
        self.checked("GET", result).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new_value: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.connection().await?;
        let (has_expected, expected) = match expected {
            Some(value) => ("1", value),
            None => ("0", &[][..]),
        };

        let result = self
            .compare_and_swap
            .key(key)
            .arg(has_expected)
            .arg(expected)
            .arg(new_value)
            .arg(ttl_millis(ttl))
            .invoke_async::<_, i64>(&mut conn)
            .await;
        let swapped = self.checked("CAS script", result).await?;

        Ok(swapped == 1)
    }

    async fn increment_with_expiry(
        &self,
        key: &str,
        delta: i64,
        ttl_if_new: Duration,
    ) -> Result<i64> {
        let mut conn = self.connection().await?;
        let result = self
            .increment_with_expiry
            .key(key)
            .arg(delta)
            .arg(ttl_millis(ttl_if_new))
            .invoke_async(&mut conn)
            .await;
        self.checked("Increment script", result).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let result = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, ()>(&mut conn)
            .await;
        self.checked("SET", result).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let result = redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await;
        self.checked("DEL", result).await
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let result = redis::cmd("PING").query_async::<_, String>(&mut conn).await;
        self.checked("Ping", result).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
