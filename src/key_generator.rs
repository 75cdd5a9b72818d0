//! Rate limit key derivation from request identity.

use crate::error::{AdmissionError, Result};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

/// Strategy for generating rate limit keys
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Use client IP address
    IpAddress,
    /// Use API key from header
    ApiKey,
    /// Use user ID from header
    UserId,
    /// Composite key from multiple sources
    Composite(Vec<KeyStrategy>),
}

/// Generates rate limiting keys based on request context
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    default_strategy: KeyStrategy,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn api_key(headers: &HeaderMap) -> Result<String> {
    header(headers, "x-api-key")
        .or_else(|| header(headers, "authorization"))
        .map(sanitize_key)
        .ok_or(AdmissionError::MissingApiKey)
}

fn user_id(headers: &HeaderMap) -> Result<String> {
    header(headers, "x-user-id")
        .map(sanitize_key)
        .ok_or(AdmissionError::MissingUserId)
}

impl KeyGenerator {
    pub fn new(strategy: KeyStrategy) -> Self {
        Self {
            default_strategy: strategy,
        }
    }

    pub fn strategy(&self) -> &KeyStrategy {
        &self.default_strategy
    }

    /// Generate a rate limit key from request headers and client address
    pub fn generate_key(&self, headers: &HeaderMap, client_ip: &str) -> Result<String> {
        match &self.default_strategy {
            KeyStrategy::IpAddress => Ok(format!("ip:{}", sanitize_key(client_ip))),
            KeyStrategy::ApiKey => Ok(format!("api:{}", api_key(headers)?)),
            KeyStrategy::UserId => Ok(format!("user:{}", user_id(headers)?)),
            KeyStrategy::Composite(strategies) => {
                let mut key_parts = Vec::with_capacity(strategies.len());
                for sub_strategy in strategies {
                    let part = match sub_strategy {
                        KeyStrategy::IpAddress => sanitize_key(client_ip),
                        KeyStrategy::ApiKey => api_key(headers)?,
                        KeyStrategy::UserId => user_id(headers)?,
                        KeyStrategy::Composite(_) => {
                            return Err(AdmissionError::InvalidKeyStrategy(
                                "Nested composite keys not supported".to_string(),
                            ))
                        }
                    };
                    key_parts.push(part);
                }
                Ok(format!("composite:{}", key_parts.join(":")))
            }
        }
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new(KeyStrategy::IpAddress)
    }
}

/// Extract client IP from proxy headers
pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    header(headers, "x-forwarded-for")
        .and_then(|xff| xff.split(',').next())
        .map(|ip| ip.trim())
        .filter(|ip| !ip.is_empty())
        .or_else(|| header(headers, "x-real-ip"))
        .or_else(|| header(headers, "cf-connecting-ip"))
        .map(str::to_string)
}

/// Sanitize key components so they are safe inside store keys
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
