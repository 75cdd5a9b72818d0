use crate::store::KeyStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: DependencyStatus,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub store: ServiceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub backend: String,
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

#[derive(Clone)]
pub struct HealthChecker {
    store: Arc<dyn KeyStore>,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME).unwrap_or_default().as_secs();

        let store_status = self.check_store().await;
        let overall_status = if store_status.status == "healthy" {
            "healthy"
        } else {
            // Still serving; rate limiting and idempotency follow their failure policies.
            "degraded"
        };

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: now
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            dependencies: DependencyStatus {
                store: store_status,
            },
        }
    }

    async fn check_store(&self) -> ServiceStatus {
        let start = Instant::now();
        let result = self.store.ping().await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(()) => ServiceStatus {
                backend: self.store.backend().to_string(),
                status: "healthy".to_string(),
                response_time_ms,
                error: None,
            },
            Err(e) => ServiceStatus {
                backend: self.store.backend().to_string(),
                status: "unavailable".to_string(),
                response_time_ms,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::{MemoryStore, RedisStore};

    #[test]
    fn test_health_status_serialization() {
        let status = HealthStatus {
            status: "healthy".to_string(),
            timestamp: 1234567890,
            version: "1.0.0".to_string(),
            uptime_seconds: 3600,
            dependencies: DependencyStatus {
                store: ServiceStatus {
                    backend: "memory".to_string(),
                    status: "healthy".to_string(),
                    response_time_ms: 5,
                    error: None,
                },
            },
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains("1234567890"));
    }

    #[tokio::test]
    async fn test_memory_store_is_healthy() {
        let checker = HealthChecker::new(Arc::new(MemoryStore::new(Arc::new(SystemClock))));
        let status = checker.check_health().await;
        assert!(status.is_healthy());
        assert_eq!(status.dependencies.store.backend, "memory");
    }

    #[tokio::test]
    async fn test_unreachable_redis_is_degraded() {
        let store = RedisStore::new("redis://127.0.0.1:1").unwrap();
        let checker = HealthChecker::new(Arc::new(store));
        let status = checker.check_health().await;
        assert_eq!(status.status, "degraded");
        assert!(status.dependencies.store.error.is_some());
    }
}
