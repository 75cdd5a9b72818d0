use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::coordinator::{AdmissionRequest, Outcome, RequestCoordinator};
use crate::error::{AdmissionError, ErrorResponse};
use crate::health::HealthChecker;
use crate::idempotency::{HandlerResponse, IdempotencyRecord, IdempotencyStatus};
use crate::key_generator::KeyGenerator;
use crate::metrics::MetricsCollector;
use crate::middleware::ClientIp;
use crate::response::{apply_rate_limit_headers, RateLimitResponse};
use crate::validation::RequestValidator;

/// Shared application state
pub type SharedState = Arc<AppState>;

/// Application state containing the admission core and its surroundings
pub struct AppState {
    pub coordinator: RequestCoordinator,
    pub key_generator: KeyGenerator,
    pub health: HealthChecker,
    pub metrics: MetricsCollector,
    /// Number of times an operation handler actually ran.
    pub executions: Arc<AtomicU64>,
}

#[derive(Debug, Serialize)]
pub struct OperationResponse {
    pub operation_id: String,
    pub operation: String,
    pub method: String,
    pub execution: u64,
    pub payload: serde_json::Value,
}

/// Operator view of a stored idempotency record.
#[derive(Debug, Serialize)]
pub struct IdempotencyRecordResponse {
    pub idempotency_key: String,
    pub status: IdempotencyStatus,
    pub request_hash: String,
    pub response_code: u16,
    pub response_body: String,
    pub error: Option<String>,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

impl From<IdempotencyRecord> for IdempotencyRecordResponse {
    fn from(record: IdempotencyRecord) -> Self {
        Self {
            response_body: String::from_utf8_lossy(&record.response_body).into_owned(),
            idempotency_key: record.idempotency_key,
            status: record.status,
            request_hash: record.request_hash,
            response_code: record.response_code,
            error: record.error,
            created_at_ms: record.created_at_ms,
            expires_at_ms: record.expires_at_ms,
        }
    }
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new("not_found", message, 404)),
    )
        .into_response()
}

fn parse_payload(body: &[u8]) -> Result<serde_json::Value, AdmissionError> {
    if body.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_slice(body)
        .map_err(|e| AdmissionError::Validation(format!("request body is not valid JSON: {}", e)))
}

fn validate_operation(
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(Option<String>, serde_json::Value), AdmissionError> {
    let idempotency_key = RequestValidator::idempotency_key(headers)?;
    Ok((idempotency_key, parse_payload(body)?))
}

/// The demo business operation. Each run is a distinct side effect.
fn perform_operation(
    executions: &AtomicU64,
    name: String,
    method: &Method,
    payload: serde_json::Value,
) -> anyhow::Result<HandlerResponse> {
    let execution = executions.fetch_add(1, Ordering::SeqCst) + 1;
    let status = if *method == Method::POST { 201 } else { 200 };
    let body = serde_json::to_vec(&OperationResponse {
        operation_id: uuid::Uuid::new_v4().to_string(),
        operation: name,
        method: method.to_string(),
        execution,
        payload,
    })?;
    Ok(HandlerResponse::new(status, body))
}

/// Check and record one request against the limit for a key
pub async fn check_rate_limit(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<Response, AdmissionError> {
    RequestValidator::validate_limit_key(&key)?;

    let decision = state.coordinator.rate_limiter().check(&key).await?;
    let status = if decision.allowed {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };

    let body = RateLimitResponse::from_decision(&key, &decision);
    let mut response = (status, Json(body)).into_response();
    apply_rate_limit_headers(response.headers_mut(), &decision);
    Ok(response)
}

/// Run a named operation behind rate limiting and, for mutating methods,
/// idempotency.
pub async fn run_operation(
    State(state): State<SharedState>,
    client_ip: Option<Extension<ClientIp>>,
    method: Method,
    uri: Uri,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AdmissionError> {
    let client_ip = client_ip
        .map(|Extension(ClientIp(ip))| ip)
        .unwrap_or_else(|| "unknown".to_string());
    let limit_key = state.key_generator.generate_key(&headers, &client_ip)?;

    let response = match state.coordinator.admit(&limit_key).await {
        Ok(decision) => match validate_operation(&headers, &body) {
            Ok((idempotency_key, payload)) => {
                let request = AdmissionRequest::new(limit_key.clone(), method.clone(), uri.path())
                    .with_idempotency_key(idempotency_key)
                    .with_body(body.to_vec());

                let executions = state.executions.clone();
                state
                    .coordinator
                    .handle_admitted(&request, &decision, move || async move {
                        perform_operation(&executions, name, &method, payload)
                    })
                    .await
            }
            Err(err) => state.coordinator.reject(&err, Outcome::Rejected, &decision),
        },
        Err(refused) => refused,
    };

    debug!(
        limit_key = %limit_key,
        outcome = response.outcome.as_str(),
        status = %response.status,
        "operation admitted"
    );
    state.metrics.record(&limit_key, response.outcome).await;

    Ok(response.into_response())
}

/// Inspect the stored record for an idempotency key
pub async fn get_idempotency_record(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<Response, AdmissionError> {
    RequestValidator::validate_idempotency_key(&key)?;

    match state.coordinator.idempotency().lookup(&key).await? {
        Some(record) => Ok(Json(IdempotencyRecordResponse::from(record)).into_response()),
        None => Ok(not_found("no record for this idempotency key")),
    }
}

/// Drop the stored record so the key can be used again
pub async fn delete_idempotency_record(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<StatusCode, AdmissionError> {
    RequestValidator::validate_idempotency_key(&key)?;
    state.coordinator.idempotency().forget(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Admission counters
pub async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.metrics.snapshot().await)
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.health.check_health().await)
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<SharedState>) -> impl IntoResponse {
    let health = state.health.check_health().await;
    let store = health.dependencies.store;

    if health.status == "healthy" {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": store.backend,
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "store": store.backend,
                "error": store.error,
            })),
        )
    }
}
