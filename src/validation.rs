use crate::error::{AdmissionError, Result};
use axum::http::{HeaderMap, Method};
use regex::Regex;
use std::sync::LazyLock;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Opaque, but limited to 1-255 visible ASCII characters.
static IDEMPOTENCY_KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\x21-\x7E]{1,255}$").expect("valid idempotency key pattern"));

static LIMIT_KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.:\-]{1,128}$").expect("valid limit key pattern"));

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Reads the `Idempotency-Key` header. Absent means no deduplication.
    pub fn idempotency_key(headers: &HeaderMap) -> Result<Option<String>> {
        let Some(value) = headers.get(IDEMPOTENCY_KEY_HEADER) else {
            return Ok(None);
        };
        let key = value.to_str().map_err(|_| {
            AdmissionError::Validation("Idempotency-Key must be visible ASCII".to_string())
        })?;
        Self::validate_idempotency_key(key)?;
        Ok(Some(key.to_string()))
    }

    pub fn validate_idempotency_key(key: &str) -> Result<()> {
        if !IDEMPOTENCY_KEY_PATTERN.is_match(key) {
            return Err(AdmissionError::Validation(
                "Idempotency-Key must be 1-255 visible ASCII characters".to_string(),
            ));
        }
        Ok(())
    }

    /// Validates a limit key passed in a path
    pub fn validate_limit_key(key: &str) -> Result<()> {
        if !LIMIT_KEY_PATTERN.is_match(key) {
            return Err(AdmissionError::Validation(
                "Rate limit key can only contain alphanumeric characters, '.', ':', '-' and '_'"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a method changes server state and so gets idempotency protection.
    pub fn is_mutating(method: &Method) -> bool {
        matches!(
            *method,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        )
    }
}
