use admission::algorithms::{
    FixedWindowLimiter, RateLimitAlgorithm, SlidingWindowLimiter, TokenBucketLimiter,
};
use admission::clock::{Clock, ManualClock, SystemClock};
use admission::config::{AdmissionSettings, Config};
use admission::error::AdmissionError;
use admission::handlers::AppState;
use admission::idempotency::{HandlerResponse, IdempotencyCoordinator};
use admission::server::create_app;
use admission::store::{KeyStore, MemoryStore};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// A window-aligned instant: 1_700_000_040_000 is a multiple of 60s.
const ALIGNED_MS: u64 = 1_700_000_040_000;
const MINUTE: Duration = Duration::from_secs(60);

fn manual_clock(at_ms: u64) -> Arc<ManualClock> {
    Arc::new(ManualClock::at_unix_millis(at_ms))
}

fn idempotency(clock: Arc<dyn Clock>, ttl: Duration) -> IdempotencyCoordinator {
    let store = Arc::new(MemoryStore::new(clock.clone()));
    IdempotencyCoordinator::new(
        store,
        clock,
        ttl,
        Duration::from_secs(5),
        Duration::from_millis(10),
    )
}

fn respond(body: &str) -> anyhow::Result<HandlerResponse> {
    Ok(HandlerResponse::new(200, body.as_bytes().to_vec()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_execute_once() {
    let idem = idempotency(Arc::new(SystemClock), Duration::from_secs(3600));
    let executions = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let idem = idem.clone();
        let executions = executions.clone();
        tasks.push(tokio::spawn(async move {
            idem.execute("order-42", "same-payload", || async move {
                let n = executions.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, anyhow::Error>(HandlerResponse::new(201, format!("execution {}", n)))
            })
            .await
        }));
    }

    let mut responses = Vec::new();
    for task in tasks {
        responses.push(task.await.unwrap().unwrap());
    }

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(responses.iter().filter(|r| !r.replayed).count(), 1);
    for response in &responses {
        assert_eq!(response.response, responses[0].response);
    }
    assert_eq!(responses[0].response.body, b"execution 1".to_vec());
}

#[tokio::test]
async fn test_same_key_same_payload_then_conflict() {
    let idem = idempotency(Arc::new(SystemClock), Duration::from_secs(3600));
    let runs_a = AtomicUsize::new(0);
    let runs_b = AtomicUsize::new(0);

    let first = idem
        .execute("key-1", "hash-a", || async {
            runs_a.fetch_add(1, Ordering::SeqCst);
            respond("A")
        })
        .await
        .unwrap();
    let second = idem
        .execute("key-1", "hash-a", || async {
            runs_a.fetch_add(1, Ordering::SeqCst);
            respond("A")
        })
        .await
        .unwrap();
    assert_eq!(runs_a.load(Ordering::SeqCst), 1);
    assert_eq!(first.response, second.response);

    let conflict = idem
        .execute("key-1", "hash-b", || async {
            runs_b.fetch_add(1, Ordering::SeqCst);
            respond("B")
        })
        .await;
    assert!(matches!(
        conflict,
        Err(AdmissionError::IdempotencyKeyConflict { .. })
    ));
    assert_eq!(runs_b.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_completed_record_expires_after_ttl() {
    let clock = manual_clock(ALIGNED_MS);
    let idem = idempotency(clock.clone(), Duration::from_secs(3600));
    let runs = AtomicUsize::new(0);

    idem.execute("key-ttl", "h", || async {
        runs.fetch_add(1, Ordering::SeqCst);
        respond("first")
    })
    .await
    .unwrap();

    clock.advance(Duration::from_secs(3599));
    let replay = idem
        .execute("key-ttl", "h", || async {
            runs.fetch_add(1, Ordering::SeqCst);
            respond("second")
        })
        .await
        .unwrap();
    assert!(replay.replayed);

    clock.advance(Duration::from_secs(2));
    let fresh = idem
        .execute("key-ttl", "h", || async {
            runs.fetch_add(1, Ordering::SeqCst);
            respond("second")
        })
        .await
        .unwrap();
    assert!(!fresh.replayed);
    assert_eq!(fresh.response.body, b"second".to_vec());
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

async fn allowed_count(
    limiter: &dyn RateLimitAlgorithm,
    key: &str,
    requests: usize,
    limit: u64,
) -> usize {
    let mut allowed = 0;
    for _ in 0..requests {
        if limiter.allow(key, limit, MINUTE).await.unwrap().allowed {
            allowed += 1;
        }
    }
    allowed
}

#[tokio::test]
async fn test_fixed_window_allows_boundary_burst() {
    let clock = manual_clock(ALIGNED_MS + 59_900);
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let limiter = FixedWindowLimiter::new(store, clock.clone());

    assert_eq!(allowed_count(&limiter, "client", 10, 10).await, 10);
    clock.advance(Duration::from_millis(200));
    assert_eq!(allowed_count(&limiter, "client", 10, 10).await, 10);
}

#[tokio::test]
async fn test_sliding_window_limits_boundary_burst() {
    let clock = manual_clock(ALIGNED_MS + 59_900);
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let limiter = SlidingWindowLimiter::new(store, clock.clone());

    assert_eq!(allowed_count(&limiter, "client", 10, 10).await, 10);
    clock.advance(Duration::from_millis(200));
    // The previous window still weighs floor(10 * 59.9 / 60) = 9 requests.
    assert_eq!(allowed_count(&limiter, "client", 10, 10).await, 1);
}

#[tokio::test]
async fn test_sliding_window_steady_rate_is_never_denied() {
    let clock = manual_clock(ALIGNED_MS);
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let limiter = SlidingWindowLimiter::new(store, clock.clone());

    for window in 0..5u64 {
        for slot in 0..10u64 {
            let offset_ms = slot * 6_000 + 3_000;
            clock.set_unix_millis(ALIGNED_MS + window * 60_000 + offset_ms);
            let decision = limiter.allow("steady", 10, MINUTE).await.unwrap();
            assert!(decision.allowed, "denied in window {window} slot {slot}");
        }
    }
}

#[tokio::test]
async fn test_token_bucket_burst_then_steady_rate() {
    let clock = manual_clock(ALIGNED_MS);
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let limiter = TokenBucketLimiter::new(store, clock.clone(), 5, 1.0);

    assert_eq!(allowed_count(&limiter, "burst", 5, 0).await, 5);
    let sixth = limiter.allow("burst", 0, MINUTE).await.unwrap();
    assert!(!sixth.allowed);
    assert_eq!(sixth.retry_after, Some(Duration::from_secs(1)));

    for _ in 0..3 {
        clock.advance(Duration::from_secs(1));
        assert_eq!(allowed_count(&limiter, "burst", 3, 0).await, 1);
    }
}

#[tokio::test]
async fn test_rate_limits_and_idempotency_share_a_store() {
    let clock = manual_clock(ALIGNED_MS);
    let store: Arc<dyn KeyStore> = Arc::new(MemoryStore::new(clock.clone()));
    let limiter = FixedWindowLimiter::new(store.clone(), clock.clone());
    let idem = IdempotencyCoordinator::new(
        store.clone(),
        clock.clone(),
        Duration::from_secs(60),
        Duration::ZERO,
        Duration::from_millis(10),
    );

    idem.execute("client", "h", || async { respond("ok") })
        .await
        .unwrap();
    assert_eq!(allowed_count(&limiter, "client", 3, 3).await, 3);

    assert!(store.get("idem:client").await.unwrap().is_some());
    let window_index = ALIGNED_MS / 60_000;
    let counter = store
        .get(&format!("ratelimit:fixed:client:{}", window_index))
        .await
        .unwrap();
    assert_eq!(counter, Some(b"3".to_vec()));
}

fn app_with_limit(limit: u64) -> (Router, Arc<AppState>) {
    let config = Config {
        admission: AdmissionSettings {
            limit,
            ..AdmissionSettings::default()
        },
        ..Config::default()
    };
    let clock: Arc<dyn Clock> = manual_clock(ALIGNED_MS + 1_000);
    let store: Arc<dyn KeyStore> = Arc::new(MemoryStore::new(clock.clone()));
    let state = Arc::new(AppState::new(&config, store, clock));
    (create_app(state.clone()), state)
}

fn operation(method: &str, idempotency_key: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri("/operations/orders")
        .header("content-type", "application/json")
        .header("x-forwarded-for", "203.0.113.7");
    if let Some(key) = idempotency_key {
        builder = builder.header("idempotency-key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _) = app_with_limit(10);
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["dependencies"]["store"]["backend"], "memory");
}

#[tokio::test]
async fn test_ready_endpoint() {
    let (app, _) = app_with_limit(10);
    let response = app.oneshot(get("/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_idempotent_replay_over_http() {
    let (app, state) = app_with_limit(10);

    let first = app
        .clone()
        .oneshot(operation("POST", Some("order-1"), r#"{"amount":5}"#))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    assert!(first.headers().get("idempotent-replayed").is_none());
    assert_eq!(first.headers()["x-ratelimit-limit"], "10");
    assert_eq!(first.headers()["x-ratelimit-remaining"], "9");
    let first_body = json_body(first).await;

    let second = app
        .oneshot(operation("POST", Some("order-1"), r#"{"amount":5}"#))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CREATED);
    assert_eq!(second.headers()["idempotent-replayed"], "true");
    assert_eq!(second.headers()["x-ratelimit-remaining"], "8");
    let second_body = json_body(second).await;

    assert_eq!(first_body, second_body);
    assert_eq!(first_body["execution"], 1);
    assert_eq!(first_body["payload"]["amount"], 5);
    assert_eq!(state.executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_key_reuse_with_different_body_conflicts() {
    let (app, state) = app_with_limit(10);

    app.clone()
        .oneshot(operation("POST", Some("order-2"), r#"{"amount":5}"#))
        .await
        .unwrap();
    let conflict = app
        .oneshot(operation("POST", Some("order-2"), r#"{"amount":6}"#))
        .await
        .unwrap();

    assert_eq!(conflict.status(), StatusCode::CONFLICT);
    let body = json_body(conflict).await;
    assert_eq!(body["error"], "idempotency_key_conflict");
    assert_eq!(body["details"]["conflicting_key"], "order-2");
    assert_eq!(state.executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_without_key_every_request_executes() {
    let (app, state) = app_with_limit(10);
    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(operation("POST", None, r#"{"amount":1}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    assert_eq!(state.executions.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_rate_limit_exceeded_over_http() {
    let (app, state) = app_with_limit(2);

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(operation("POST", None, "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().get("retry-after").is_none());
    }

    let throttled = app.oneshot(operation("POST", None, "{}")).await.unwrap();
    assert_eq!(throttled.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(throttled.headers()["x-ratelimit-remaining"], "0");
    assert_eq!(throttled.headers()["retry-after"], "59");

    let reset_at = (ALIGNED_MS + 60_000) / 1000;
    assert_eq!(throttled.headers()["x-ratelimit-reset"], reset_at.to_string().as_str());

    let body = json_body(throttled).await;
    assert_eq!(body["error"], "rate_limit_exceeded");
    assert_eq!(body["details"]["scope"], "ip:203.0.113.7");
    assert_eq!(body["details"]["reset_at"], reset_at);
    assert_eq!(state.executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalid_json_is_rejected() {
    let (app, state) = app_with_limit(10);
    let response = app
        .oneshot(operation("POST", Some("order-3"), "{not json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(state.executions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_requests_count_against_the_limit() {
    let (app, state) = app_with_limit(2);
    let mut statuses = Vec::new();
    for _ in 0..5 {
        let response = app
            .clone()
            .oneshot(operation("POST", Some("order-bad"), "{bad"))
            .await
            .unwrap();
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        statuses.push(response.status());
    }

    assert_eq!(
        statuses,
        vec![
            StatusCode::UNPROCESSABLE_ENTITY,
            StatusCode::UNPROCESSABLE_ENTITY,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::TOO_MANY_REQUESTS,
        ]
    );
    assert_eq!(state.executions.load(Ordering::SeqCst), 0);

    let metrics = app.oneshot(get("/metrics")).await.unwrap();
    let body = json_body(metrics).await;
    assert_eq!(body["outcomes"]["rejected"], 2);
    assert_eq!(body["outcomes"]["throttled"], 3);
}

#[tokio::test]
async fn test_invalid_idempotency_key_is_rejected() {
    let (app, _) = app_with_limit(10);
    let response = app
        .oneshot(operation("POST", Some("has space"), "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_idempotency_record_inspection_and_removal() {
    let (app, state) = app_with_limit(10);
    app.clone()
        .oneshot(operation("PUT", Some("order-4"), r#"{"name":"x"}"#))
        .await
        .unwrap();

    let record = app.clone().oneshot(get("/idempotency/order-4")).await.unwrap();
    assert_eq!(record.status(), StatusCode::OK);
    let body = json_body(record).await;
    assert_eq!(body["status"], "completed");
    assert_eq!(body["response_code"], 200);

    let deleted = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/idempotency/order-4")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

    let missing = app.clone().oneshot(get("/idempotency/order-4")).await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let again = app
        .oneshot(operation("PUT", Some("order-4"), r#"{"name":"x"}"#))
        .await
        .unwrap();
    assert!(again.headers().get("idempotent-replayed").is_none());
    assert_eq!(state.executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rate_limit_check_endpoint() {
    let (app, _) = app_with_limit(1);
    let check = || {
        Request::builder()
            .method("POST")
            .uri("/rate-limit/tenant-a/check")
            .body(Body::empty())
            .unwrap()
    };

    let allowed = app.clone().oneshot(check()).await.unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
    let body = json_body(allowed).await;
    assert_eq!(body["allowed"], true);
    assert_eq!(body["remaining"], 0);

    let denied = app.clone().oneshot(check()).await.unwrap();
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(denied.headers().get("retry-after").is_some());

    let invalid = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/rate-limit/bad%20key/check")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_metrics_count_outcomes() {
    let (app, _) = app_with_limit(10);
    for _ in 0..2 {
        app.clone()
            .oneshot(operation("POST", Some("order-5"), "{}"))
            .await
            .unwrap();
    }
    app.clone()
        .oneshot(operation("GET", None, ""))
        .await
        .unwrap();

    let metrics = app.oneshot(get("/metrics")).await.unwrap();
    let body = json_body(metrics).await;
    assert_eq!(body["total_requests"], 3);
    assert_eq!(body["outcomes"]["executed"], 1);
    assert_eq!(body["outcomes"]["replayed"], 1);
    assert_eq!(body["outcomes"]["passthrough"], 1);
    assert_eq!(body["tracked_clients"], 1);
}
