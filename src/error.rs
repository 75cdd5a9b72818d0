use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the admission core and the HTTP layer around it.
#[derive(Debug, Clone, Error)]
pub enum AdmissionError {
    #[error("Rate limit exceeded for '{limit_key}'")]
    RateLimitExceeded {
        limit_key: String,
        limit: u64,
        /// Unix timestamp (seconds) at which the limit resets.
        reset_at: u64,
        retry_after: Duration,
    },

    #[error("Idempotency key '{key}' was already used with a different request payload")]
    IdempotencyKeyConflict { key: String },

    #[error("Handler execution failed: {message}")]
    HandlerExecutionFailed {
        key: Option<String>,
        response_code: u16,
        message: String,
        replayed: bool,
    },

    #[error("Key store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Request with idempotency key '{key}' is still in progress")]
    PendingTimeout { key: String, waited: Duration },

    #[error("Key store contention on '{0}'")]
    StoreContention(String),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Missing API key")]
    MissingApiKey,

    #[error("Missing user id")]
    MissingUserId,

    #[error("Invalid key strategy: {0}")]
    InvalidKeyStrategy(String),
}

pub type Result<T> = std::result::Result<T, AdmissionError>;

impl From<redis::RedisError> for AdmissionError {
    fn from(err: redis::RedisError) -> Self {
        AdmissionError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for AdmissionError {
    fn from(err: serde_json::Error) -> Self {
        AdmissionError::CorruptRecord(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AdmissionError {
    fn from(err: validator::ValidationErrors) -> Self {
        AdmissionError::Configuration(err.to_string())
    }
}

impl AdmissionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdmissionError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AdmissionError::IdempotencyKeyConflict { .. } => StatusCode::CONFLICT,
            AdmissionError::PendingTimeout { .. } => StatusCode::CONFLICT,
            AdmissionError::HandlerExecutionFailed { response_code, .. } => {
                StatusCode::from_u16(*response_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            AdmissionError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AdmissionError::StoreContention(_) => StatusCode::SERVICE_UNAVAILABLE,
            AdmissionError::CorruptRecord(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AdmissionError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AdmissionError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AdmissionError::MissingApiKey
            | AdmissionError::MissingUserId
            | AdmissionError::InvalidKeyStrategy(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Seconds a client should wait before retrying, where that is meaningful.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            AdmissionError::RateLimitExceeded { retry_after, .. } => {
                Some(ceil_secs(*retry_after).max(1))
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdmissionError::RateLimitExceeded { .. }
                | AdmissionError::PendingTimeout { .. }
                | AdmissionError::StoreUnavailable(_)
                | AdmissionError::StoreContention(_)
        )
    }
}

pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
            details: None,
        }
    }

    pub fn from_admission_error(err: &AdmissionError) -> Self {
        let code = err.status_code().as_u16();
        let message = err.to_string();
        let mut response = match err {
            AdmissionError::RateLimitExceeded { .. } => Self::new("rate_limit_exceeded", &message, code),
            AdmissionError::IdempotencyKeyConflict { .. } => {
                Self::new("idempotency_key_conflict", &message, code)
            }
            AdmissionError::HandlerExecutionFailed { .. } => Self::new("handler_failed", &message, code),
            AdmissionError::StoreUnavailable(_) => Self::new("service_unavailable", &message, code),
            AdmissionError::PendingTimeout { .. } => Self::new("request_in_progress", &message, code),
            AdmissionError::StoreContention(_) => Self::new("store_contention", &message, code),
            AdmissionError::CorruptRecord(_) => Self::new("internal_error", &message, code),
            AdmissionError::Configuration(_) => Self::new("configuration_error", &message, code),
            AdmissionError::Validation(_) => Self::new("validation_error", &message, code),
            AdmissionError::MissingApiKey
            | AdmissionError::MissingUserId
            | AdmissionError::InvalidKeyStrategy(_) => Self::new("bad_request", &message, code),
        };

        response.details = match err {
            AdmissionError::RateLimitExceeded {
                limit_key,
                limit,
                reset_at,
                ..
            } => Some(serde_json::json!({
                "scope": limit_key,
                "limit": limit,
                "reset_at": reset_at,
            })),
            AdmissionError::IdempotencyKeyConflict { key } => {
                Some(serde_json::json!({ "conflicting_key": key }))
            }
            AdmissionError::PendingTimeout { key, waited } => Some(serde_json::json!({
                "idempotency_key": key,
                "waited_ms": waited.as_millis() as u64,
            })),
            AdmissionError::HandlerExecutionFailed { key, .. } => Some(serde_json::json!({
                "idempotency_key": key,
            })),
            _ => None,
        };

        response
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_admission_error(&self);
        let mut response = (self.status_code(), Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs() {
            response
                .headers_mut()
                .insert("Retry-After", HeaderValue::from(secs));
        }
        response
    }
}
