use crate::algorithms::Algorithm;
use crate::error::{AdmissionError, Result};
use crate::key_generator::KeyStrategy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// What to do when the key store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Let the request through without the guarantee.
    FailOpen,
    /// Reject the request with 503.
    FailClosed,
}

/// Service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Server bind address
    pub bind_addr: SocketAddr,

    /// Redis connection URL. Without one the in-memory store is used.
    #[validate(custom(function = "validate_redis_url"))]
    pub redis_url: Option<String>,

    pub log_level: String,

    /// How often expired entries are swept from the in-memory store
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero"))]
    pub cleanup_interval: Duration,

    /// How the rate limit key is derived from a request
    pub key_strategy: KeyStrategy,

    #[validate(nested)]
    pub admission: AdmissionSettings,
}

/// Rate limiting and idempotency options.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AdmissionSettings {
    pub algorithm: Algorithm,

    /// Requests per window (fixed and sliding window)
    #[validate(range(min = 1))]
    pub limit: u64,

    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero"))]
    pub window: Duration,

    /// Token bucket capacity
    #[validate(range(min = 1))]
    pub bucket_capacity: u64,

    /// Token bucket refill rate in tokens per second
    #[validate(range(exclusive_min = 0.0))]
    pub refill_rate: f64,

    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero"))]
    pub idempotency_ttl: Duration,

    /// Zero means duplicates of an in-flight request are answered at once
    #[serde(with = "humantime_serde")]
    pub pending_wait_timeout: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero"))]
    pub pending_poll_interval: Duration,

    pub rate_limit_store_failure: FailurePolicy,

    pub idempotency_store_failure: FailurePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            redis_url: None,
            log_level: "info".to_string(),
            cleanup_interval: Duration::from_secs(300),
            key_strategy: KeyStrategy::IpAddress,
            admission: AdmissionSettings::default(),
        }
    }
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Fixed,
            limit: 100,
            window: Duration::from_secs(60),
            bucket_capacity: 20,
            refill_rate: 10.0,
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            pending_wait_timeout: Duration::from_secs(5),
            pending_poll_interval: Duration::from_millis(50),
            rate_limit_store_failure: FailurePolicy::FailOpen,
            idempotency_store_failure: FailurePolicy::FailClosed,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    AdmissionError::Configuration(format!(
                        "failed to read {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Self::from_json(&raw)?
            }
            None => Self::default(),
        };
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| AdmissionError::Configuration(format!("invalid config: {}", e)))
    }

    /// Validate every field, nested settings included.
    pub fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }
}

fn validate_non_zero(value: &Duration) -> std::result::Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::new("duration_must_be_positive"));
    }
    Ok(())
}

fn validate_redis_url(url: &str) -> std::result::Result<(), ValidationError> {
    if !url.starts_with("redis://") && !url.starts_with("rediss://") {
        return Err(ValidationError::new("redis_url_scheme"));
    }
    Ok(())
}
