use crate::algorithms::RateLimitDecision;
use crate::clock::unix_secs_ceil;
use crate::error::ceil_secs;
use axum::http::{HeaderMap, HeaderValue};
use serde::Serialize;

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";
pub const RETRY_AFTER: &str = "retry-after";
pub const IDEMPOTENT_REPLAYED: &str = "idempotent-replayed";

/// Writes `X-RateLimit-*` headers, plus `Retry-After` when the request was denied.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(
        X_RATELIMIT_RESET,
        HeaderValue::from(unix_secs_ceil(decision.reset_at)),
    );

    if let Some(retry_after) = decision.retry_after.filter(|_| !decision.allowed) {
        headers.insert(RETRY_AFTER, HeaderValue::from(ceil_secs(retry_after).max(1)));
    }
}

#[derive(Debug, Serialize)]
pub struct RateLimitResponse {
    pub key: String,
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: u64,
    pub retry_after: Option<u64>,
}

impl RateLimitResponse {
    pub fn from_decision(key: &str, decision: &RateLimitDecision) -> Self {
        Self {
            key: key.to_string(),
            allowed: decision.allowed,
            limit: decision.limit,
            remaining: decision.remaining,
            reset_time: unix_secs_ceil(decision.reset_at),
            retry_after: decision
                .retry_after
                .filter(|_| !decision.allowed)
                .map(|d| ceil_secs(d).max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::from_unix_millis;
    use std::time::Duration;

    #[test]
    fn test_allowed_headers() {
        let decision = RateLimitDecision::allowed(10, 7, from_unix_millis(120_000));
        let mut headers = HeaderMap::new();
        apply_rate_limit_headers(&mut headers, &decision);

        assert_eq!(headers[X_RATELIMIT_LIMIT], "10");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "7");
        assert_eq!(headers[X_RATELIMIT_RESET], "120");
        assert!(headers.get(RETRY_AFTER).is_none());
    }

    #[test]
    fn test_denied_headers_include_retry_after() {
        let decision = RateLimitDecision::denied(
            10,
            from_unix_millis(120_000),
            from_unix_millis(117_500),
        );
        let mut headers = HeaderMap::new();
        apply_rate_limit_headers(&mut headers, &decision);

        assert_eq!(headers[X_RATELIMIT_REMAINING], "0");
        assert_eq!(headers[RETRY_AFTER], "3");
    }

    #[test]
    fn test_rate_limit_response_body() {
        let decision = RateLimitDecision {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_at: from_unix_millis(61_000),
            retry_after: Some(Duration::from_millis(200)),
        };
        let body = RateLimitResponse::from_decision("ip:1.2.3.4", &decision);
        assert_eq!(body.reset_time, 61);
        assert_eq!(body.retry_after, Some(1));

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["key"], "ip:1.2.3.4");
        assert_eq!(json["allowed"], false);
    }
}
