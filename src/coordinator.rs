//! Request admission: rate limiting first, then at-most-once execution for
//! mutating requests that carry an idempotency key.

use crate::algorithms::RateLimitDecision;
use crate::clock::{unix_secs_ceil, Clock};
use crate::config::{AdmissionSettings, FailurePolicy};
use crate::error::{AdmissionError, ErrorResponse};
use crate::idempotency::{
    failure_status, request_fingerprint, HandlerResponse, IdempotencyCoordinator,
};
use crate::rate_limiter::RateLimiter;
use crate::response::{apply_rate_limit_headers, IDEMPOTENT_REPLAYED, RETRY_AFTER};
use crate::store::KeyStore;
use crate::validation::RequestValidator;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// How a request left the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The handler ran under an idempotency claim.
    Executed,
    /// A stored response was returned without running the handler.
    Replayed,
    /// The handler ran without idempotency protection.
    Passthrough,
    Throttled,
    Conflict,
    InProgress,
    HandlerFailed,
    StoreUnavailable,
    /// The request was admitted but failed validation.
    Rejected,
}

impl Outcome {
    pub const ALL: [Outcome; 9] = [
        Outcome::Executed,
        Outcome::Replayed,
        Outcome::Passthrough,
        Outcome::Throttled,
        Outcome::Conflict,
        Outcome::InProgress,
        Outcome::HandlerFailed,
        Outcome::StoreUnavailable,
        Outcome::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Executed => "executed",
            Outcome::Replayed => "replayed",
            Outcome::Passthrough => "passthrough",
            Outcome::Throttled => "throttled",
            Outcome::Conflict => "conflict",
            Outcome::InProgress => "in_progress",
            Outcome::HandlerFailed => "handler_failed",
            Outcome::StoreUnavailable => "store_unavailable",
            Outcome::Rejected => "rejected",
        }
    }
}

/// Everything the coordinator needs to know about an incoming request.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub limit_key: String,
    pub method: Method,
    pub path: String,
    pub idempotency_key: Option<String>,
    pub body: Vec<u8>,
    /// Overrides the method-based mutating check when set.
    pub mutating: Option<bool>,
}

impl AdmissionRequest {
    pub fn new(limit_key: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            limit_key: limit_key.into(),
            method,
            path: path.into(),
            idempotency_key: None,
            body: Vec::new(),
            mutating: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_mutating(mut self, mutating: bool) -> Self {
        self.mutating = Some(mutating);
        self
    }

    pub fn is_mutating(&self) -> bool {
        self.mutating
            .unwrap_or_else(|| RequestValidator::is_mutating(&self.method))
    }

    pub fn request_hash(&self) -> String {
        request_fingerprint(self.method.as_str(), &self.path, &self.body)
    }
}

/// The response to send back, plus how it was produced.
#[derive(Debug, Clone)]
pub struct AdmissionResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub outcome: Outcome,
}

impl AdmissionResponse {
    fn from_handler(response: HandlerResponse, outcome: Outcome) -> Self {
        Self {
            status: StatusCode::from_u16(response.status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers: HeaderMap::new(),
            body: response.body,
            outcome,
        }
    }

    fn from_error(err: &AdmissionError, outcome: Outcome) -> Self {
        let mut headers = HeaderMap::new();
        if let Some(secs) = err.retry_after_secs() {
            headers.insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        Self {
            status: err.status_code(),
            headers,
            body: serde_json::to_vec(&ErrorResponse::from_admission_error(err))
                .unwrap_or_default(),
            outcome,
        }
    }

    fn mark_replayed(mut self) -> Self {
        self.headers
            .insert(IDEMPOTENT_REPLAYED, HeaderValue::from_static("true"));
        self
    }

    pub fn is_replayed(&self) -> bool {
        self.headers.contains_key(IDEMPOTENT_REPLAYED)
    }
}

impl IntoResponse for AdmissionResponse {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.body).into_response();
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.extend(self.headers);
        response
    }
}

/// Composes the rate limiter and the idempotency coordinator in front of a handler.
#[derive(Clone)]
pub struct RequestCoordinator {
    rate_limiter: RateLimiter,
    idempotency: IdempotencyCoordinator,
    rate_limit_store_failure: FailurePolicy,
    idempotency_store_failure: FailurePolicy,
}

impl RequestCoordinator {
    pub fn new(rate_limiter: RateLimiter, idempotency: IdempotencyCoordinator) -> Self {
        Self {
            rate_limiter,
            idempotency,
            rate_limit_store_failure: FailurePolicy::FailOpen,
            idempotency_store_failure: FailurePolicy::FailClosed,
        }
    }

    pub fn from_settings(
        settings: &AdmissionSettings,
        store: Arc<dyn KeyStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(
            RateLimiter::from_settings(settings, store.clone(), clock.clone()),
            IdempotencyCoordinator::from_settings(settings, store, clock),
        )
        .with_failure_policies(
            settings.rate_limit_store_failure,
            settings.idempotency_store_failure,
        )
    }

    pub fn with_failure_policies(
        mut self,
        rate_limit_store_failure: FailurePolicy,
        idempotency_store_failure: FailurePolicy,
    ) -> Self {
        self.rate_limit_store_failure = rate_limit_store_failure;
        self.idempotency_store_failure = idempotency_store_failure;
        self
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn idempotency(&self) -> &IdempotencyCoordinator {
        &self.idempotency
    }

    /// Admits `request` and runs `handler` at most as often as the
    /// guarantees allow. Every response carries the rate limit headers.
    pub async fn handle<F, Fut>(&self, request: &AdmissionRequest, handler: F) -> AdmissionResponse
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<HandlerResponse>> + Send,
    {
        match self.admit(&request.limit_key).await {
            Ok(decision) => self.handle_admitted(request, &decision, handler).await,
            Err(refused) => refused,
        }
    }

    /// Counts one request against `limit_key`. A throttled or fail-closed
    /// request comes back as the finished response to send.
    pub async fn admit(
        &self,
        limit_key: &str,
    ) -> std::result::Result<RateLimitDecision, AdmissionResponse> {
        let decision = match self.rate_limiter.check(limit_key).await {
            Ok(decision) => decision,
            Err(err) => match self.rate_limit_store_failure {
                FailurePolicy::FailOpen => {
                    warn!(
                        limit_key,
                        error = %err,
                        "rate limit store failed; admitting request"
                    );
                    self.rate_limiter.fail_open_decision()
                }
                FailurePolicy::FailClosed => {
                    error!(
                        limit_key,
                        error = %err,
                        "rate limit store failed; rejecting request"
                    );
                    let unavailable = AdmissionError::StoreUnavailable(err.to_string());
                    return Err(self.reject(
                        &unavailable,
                        Outcome::StoreUnavailable,
                        &self.rate_limiter.fail_closed_decision(),
                    ));
                }
            },
        };

        if !decision.allowed {
            debug!(limit_key, "request throttled");
            let err = throttled(limit_key, &decision);
            return Err(self.reject(&err, Outcome::Throttled, &decision));
        }
        Ok(decision)
    }

    /// Runs the idempotency stage for a request that `admit` already let in.
    pub async fn handle_admitted<F, Fut>(
        &self,
        request: &AdmissionRequest,
        decision: &RateLimitDecision,
        handler: F,
    ) -> AdmissionResponse
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<HandlerResponse>> + Send,
    {
        let mut response = match request.idempotency_key.as_deref() {
            Some(key) if request.is_mutating() => {
                self.execute_idempotent(key, request, handler).await
            }
            _ => run_direct(handler).await,
        };
        apply_rate_limit_headers(&mut response.headers, decision);
        response
    }

    /// Renders `err` as a response carrying the headers of `decision`.
    pub fn reject(
        &self,
        err: &AdmissionError,
        outcome: Outcome,
        decision: &RateLimitDecision,
    ) -> AdmissionResponse {
        let mut response = AdmissionResponse::from_error(err, outcome);
        apply_rate_limit_headers(&mut response.headers, decision);
        response
    }

    async fn execute_idempotent<F, Fut>(
        &self,
        key: &str,
        request: &AdmissionRequest,
        handler: F,
    ) -> AdmissionResponse
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<HandlerResponse>> + Send,
    {
        let mut unused = Some(handler);
        let result = self
            .idempotency
            .execute(key, &request.request_hash(), || {
                let handler = unused.take();
                async move {
                    match handler {
                        Some(handler) => handler().await,
                        None => Err(anyhow::anyhow!("handler already consumed")),
                    }
                }
            })
            .await;

        match result {
            Ok(executed) if executed.replayed => {
                AdmissionResponse::from_handler(executed.response, Outcome::Replayed)
                    .mark_replayed()
            }
            Ok(executed) => AdmissionResponse::from_handler(executed.response, Outcome::Executed),
            Err(err @ AdmissionError::IdempotencyKeyConflict { .. }) => {
                AdmissionResponse::from_error(&err, Outcome::Conflict)
            }
            Err(err @ AdmissionError::PendingTimeout { .. }) => {
                AdmissionResponse::from_error(&err, Outcome::InProgress)
            }
            Err(err @ AdmissionError::HandlerExecutionFailed { .. }) => {
                let replayed =
                    matches!(err, AdmissionError::HandlerExecutionFailed { replayed: true, .. });
                let response = AdmissionResponse::from_error(&err, Outcome::HandlerFailed);
                if replayed {
                    response.mark_replayed()
                } else {
                    response
                }
            }
            Err(err) => {
                let handler = unused.take();
                match (self.idempotency_store_failure, handler) {
                    (FailurePolicy::FailOpen, Some(handler)) if err.is_retryable() => {
                        warn!(
                            key,
                            error = %err,
                            "idempotency store failed; executing without deduplication"
                        );
                        run_direct(handler).await
                    }
                    _ => {
                        error!(key, error = %err, "idempotency store failed; rejecting request");
                        let unavailable = match err {
                            AdmissionError::StoreUnavailable(_) => err,
                            other => AdmissionError::StoreUnavailable(other.to_string()),
                        };
                        AdmissionResponse::from_error(&unavailable, Outcome::StoreUnavailable)
                    }
                }
            }
        }
    }
}

fn throttled(limit_key: &str, decision: &RateLimitDecision) -> AdmissionError {
    AdmissionError::RateLimitExceeded {
        limit_key: limit_key.to_string(),
        limit: decision.limit,
        reset_at: unix_secs_ceil(decision.reset_at),
        retry_after: decision.retry_after.unwrap_or_default(),
    }
}

async fn run_direct<F, Fut>(handler: F) -> AdmissionResponse
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<HandlerResponse>>,
{
    match handler().await {
        Ok(response) => AdmissionResponse::from_handler(response, Outcome::Passthrough),
        Err(err) => {
            let failed = AdmissionError::HandlerExecutionFailed {
                key: None,
                response_code: failure_status(&err),
                message: err.to_string(),
                replayed: false,
            };
            AdmissionResponse::from_error(&failed, Outcome::HandlerFailed)
        }
    }
}
