use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::coordinator::RequestCoordinator;
use crate::handlers::{
    check_rate_limit, delete_idempotency_record, get_idempotency_record, health_check, metrics,
    readiness_check, run_operation, AppState, SharedState,
};
use crate::health::HealthChecker;
use crate::key_generator::KeyGenerator;
use crate::metrics::MetricsCollector;
use crate::middleware::logging_middleware;
use crate::store::{KeyStore, MemoryStore, RedisStore};
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

impl AppState {
    pub fn new(config: &Config, store: Arc<dyn KeyStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            coordinator: RequestCoordinator::from_settings(&config.admission, store.clone(), clock),
            key_generator: KeyGenerator::new(config.key_strategy.clone()),
            health: HealthChecker::new(store),
            metrics: MetricsCollector::new(),
            executions: Arc::new(AtomicU64::new(0)),
        }
    }
}

pub fn create_app(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .route("/rate-limit/:key/check", post(check_rate_limit))
        .route(
            "/operations/:name",
            get(run_operation)
                .post(run_operation)
                .put(run_operation)
                .patch(run_operation)
                .delete(run_operation),
        )
        .route(
            "/idempotency/:key",
            get(get_idempotency_record).delete(delete_idempotency_record),
        )
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    config: Config,
    state: SharedState,
    memory_store: Option<MemoryStore>,
}

impl Server {
    pub fn new(config: Config) -> crate::error::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (store, memory_store): (Arc<dyn KeyStore>, Option<MemoryStore>) =
            match &config.redis_url {
                Some(url) => (Arc::new(RedisStore::new(url)?), None),
                None => {
                    let memory = MemoryStore::new(clock.clone());
                    (Arc::new(memory.clone()), Some(memory))
                }
            };

        let state = Arc::new(AppState::new(&config, store, clock));
        Ok(Self {
            config,
            state,
            memory_store,
        })
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        let backend = if self.memory_store.is_some() { "memory" } else { "redis" };
        info!(
            "Admission server listening on {} (store: {}, algorithm: {})",
            self.config.bind_addr,
            backend,
            self.config.admission.algorithm
        );
        info!("Health check available at /health");
        info!("Readiness check available at /ready");

        let sweeper = self
            .memory_store
            .clone()
            .map(|store| spawn_sweeper(store, self.config.cleanup_interval));

        let app = create_app(self.state.clone());
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        served?;
        info!("Admission server stopped");
        Ok(())
    }
}

/// Periodically drops expired entries from the in-memory store.
pub fn spawn_sweeper(store: MemoryStore, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick fires immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            match store.purge_expired() {
                Ok(0) => {}
                Ok(purged) => debug!(purged, remaining = store.len(), "purged expired entries"),
                Err(e) => warn!(error = %e, "failed to purge expired entries"),
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_server_defaults_to_memory_store() {
        let server = Server::new(Config::default()).unwrap();
        assert!(server.memory_store.is_some());
    }

    #[test]
    fn test_server_with_redis_url() {
        let config = Config {
            redis_url: Some("redis://127.0.0.1:6379".to_string()),
            ..Config::default()
        };
        let server = Server::new(config).unwrap();
        assert!(server.memory_store.is_none());
    }

    #[tokio::test]
    async fn test_sweeper_purges_expired_entries() {
        let clock = Arc::new(ManualClock::at_unix_millis(1_000_000));
        let store = MemoryStore::new(clock.clone());
        store
            .set("short", b"v", Duration::from_millis(10))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(1));
        assert_eq!(store.len(), 1);

        let sweeper = spawn_sweeper(store.clone(), Duration::from_millis(5));
        for _ in 0..100 {
            if store.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sweeper.abort();
        assert!(store.is_empty());
    }
}
