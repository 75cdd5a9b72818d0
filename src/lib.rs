pub mod algorithms;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod health;
pub mod idempotency;
pub mod key_generator;
pub mod metrics;
pub mod middleware;
pub mod rate_limiter;
pub mod response;
pub mod server;
pub mod store;
pub mod validation;

pub use algorithms::{Algorithm, RateLimitDecision};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AdmissionSettings, Config, FailurePolicy};
pub use coordinator::{AdmissionRequest, AdmissionResponse, Outcome, RequestCoordinator};
pub use error::{AdmissionError, Result};
pub use idempotency::{HandlerFailure, HandlerResponse, IdempotencyCoordinator};
pub use rate_limiter::RateLimiter;
pub use server::create_app;
pub use store::{KeyStore, MemoryStore, RedisStore};
