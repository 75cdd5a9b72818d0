//! At-most-once execution keyed by a caller-supplied idempotency key.
//!
//! The first caller to claim a key (compare-and-swap against an absent key)
//! owns it: it runs the handler and writes the terminal record. Everyone else
//! either replays that record, is told the key conflicts with a different
//! payload, or waits a bounded time for the owner to finish.
//!
//! A `Pending` record is an advisory claim, not a lock. If the owner dies
//! without writing a terminal record, the key becomes claimable again once the
//! record's TTL runs out.

use crate::clock::{unix_millis, Clock};
use crate::config::AdmissionSettings;
use crate::error::{AdmissionError, Result};
use crate::store::KeyStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, warn};

const KEY_PREFIX: &str = "idem:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub request_hash: String,
    pub status: IdempotencyStatus,
    pub response_code: u16,
    pub response_body: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

impl IdempotencyRecord {
    fn pending(idempotency_key: &str, request_hash: &str, now_ms: u64, ttl: Duration) -> Self {
        Self {
            idempotency_key: idempotency_key.to_string(),
            request_hash: request_hash.to_string(),
            status: IdempotencyStatus::Pending,
            response_code: 0,
            response_body: Vec::new(),
            error: None,
            created_at_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(ttl.as_millis() as u64),
        }
    }

    fn completed(&self, response: &HandlerResponse) -> Self {
        Self {
            status: IdempotencyStatus::Completed,
            response_code: response.status,
            response_body: response.body.clone(),
            error: None,
            ..self.clone()
        }
    }

    fn failed(&self, response_code: u16, message: String) -> Self {
        Self {
            status: IdempotencyStatus::Failed,
            response_code,
            response_body: Vec::new(),
            error: Some(message),
            ..self.clone()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != IdempotencyStatus::Pending
    }

    fn response(&self) -> HandlerResponse {
        HandlerResponse {
            status: self.response_code,
            body: self.response_body.clone(),
        }
    }

    fn failure(&self, replayed: bool) -> AdmissionError {
        AdmissionError::HandlerExecutionFailed {
            key: Some(self.idempotency_key.clone()),
            response_code: self.response_code,
            message: self.error.clone().unwrap_or_default(),
            replayed,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| AdmissionError::CorruptRecord(format!("idempotency record: {}", e)))
    }
}

/// What a business handler produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HandlerResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// A handler error carrying the status code to record. Any other error is
/// recorded as a 500.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerFailure {
    pub status: u16,
    pub message: String,
}

impl HandlerFailure {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

pub(crate) fn failure_status(err: &anyhow::Error) -> u16 {
    err.downcast_ref::<HandlerFailure>()
        .map(|failure| failure.status)
        .unwrap_or(500)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotentResponse {
    pub response: HandlerResponse,
    /// True when the response came from a stored record instead of this call's execution.
    pub replayed: bool,
}

/// SHA-256 hex digest identifying the logical request behind an idempotency key.
pub fn request_fingerprint(method: &str, path: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

fn record_key(idempotency_key: &str) -> String {
    format!("{}{}", KEY_PREFIX, idempotency_key)
}

/// Overwrites the claim with its terminal record. Returns `false` without
/// writing when the claim has already expired, since the key may belong to a
/// newer owner by then.
async fn write_terminal(
    store: &dyn KeyStore,
    clock: &dyn Clock,
    store_key: &str,
    record: &IdempotencyRecord,
) -> Result<bool> {
    let now_ms = unix_millis(clock.now());
    if now_ms >= record.expires_at_ms {
        return Ok(false);
    }
    let ttl = Duration::from_millis(record.expires_at_ms - now_ms);
    store.set(store_key, &record.encode()?, ttl).await?;
    Ok(true)
}

/// Wakes in-process waiters when the owner of a key finishes.
#[derive(Default)]
struct Completions {
    by_key: Mutex<HashMap<String, Arc<Notify>>>,
}

impl Completions {
    fn subscribe(&self, store_key: &str) -> Arc<Notify> {
        let mut by_key = self.by_key.lock().unwrap_or_else(PoisonError::into_inner);
        by_key.entry(store_key.to_string()).or_default().clone()
    }

    fn unsubscribe(&self, store_key: &str, notify: &Arc<Notify>) {
        let mut by_key = self.by_key.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and the caller hold it: nobody else is waiting.
        if Arc::strong_count(notify) <= 2 {
            if let Some(current) = by_key.get(store_key) {
                if Arc::ptr_eq(current, notify) {
                    by_key.remove(store_key);
                }
            }
        }
    }

    fn complete(&self, store_key: &str) {
        let notify = self
            .by_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(store_key);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.by_key.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Writes a `Failed` record if the owner goes away before finishing.
struct ClaimGuard {
    store: Arc<dyn KeyStore>,
    clock: Arc<dyn Clock>,
    completions: Arc<Completions>,
    store_key: String,
    claim: Option<IdempotencyRecord>,
}

impl ClaimGuard {
    fn disarm(&mut self) {
        self.claim = None;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let Some(claim) = self.claim.take() else {
            return;
        };
        let record = claim.failed(500, "execution cancelled before completion".to_string());

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                key = %record.idempotency_key,
                "owner dropped outside a runtime; record stays pending until it expires"
            );
            return;
        };

        let store = self.store.clone();
        let clock = self.clock.clone();
        let completions = self.completions.clone();
        let store_key = std::mem::take(&mut self.store_key);
        runtime.spawn(async move {
            match write_terminal(store.as_ref(), clock.as_ref(), &store_key, &record).await {
                Ok(true) => warn!(key = %record.idempotency_key, "owner cancelled; recorded as failed"),
                Ok(false) => warn!(key = %record.idempotency_key, "owner cancelled after its claim expired"),
                Err(e) => error!(
                    key = %record.idempotency_key,
                    error = %e,
                    "failed to record cancelled execution"
                ),
            }
            completions.complete(&store_key);
        });
    }
}

/// Deduplicates mutating operations across retries and concurrent callers.
#[derive(Clone)]
pub struct IdempotencyCoordinator {
    store: Arc<dyn KeyStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    pending_wait_timeout: Duration,
    poll_interval: Duration,
    completions: Arc<Completions>,
}

impl IdempotencyCoordinator {
    pub fn new(
        store: Arc<dyn KeyStore>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        pending_wait_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            ttl,
            pending_wait_timeout,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            completions: Arc::new(Completions::default()),
        }
    }

    pub fn from_settings(
        settings: &AdmissionSettings,
        store: Arc<dyn KeyStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(
            store,
            clock,
            settings.idempotency_ttl,
            settings.pending_wait_timeout,
            settings.pending_poll_interval,
        )
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Runs `handler` at most once for `idempotency_key`.
    ///
    /// Callers presenting the same key and `request_hash` get the stored
    /// outcome of the single execution. A different hash yields
    /// [`AdmissionError::IdempotencyKeyConflict`]. While another caller is
    /// executing, this waits up to the pending timeout and then returns
    /// [`AdmissionError::PendingTimeout`]; a zero timeout returns it at once.
    pub async fn execute<F, Fut>(
        &self,
        idempotency_key: &str,
        request_hash: &str,
        handler: F,
    ) -> Result<IdempotentResponse>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<HandlerResponse>> + Send,
    {
        let store_key = record_key(idempotency_key);
        let started = Instant::now();
        let deadline = started + self.pending_wait_timeout;

        loop {
            let now_ms = unix_millis(self.clock.now());
            let claim = IdempotencyRecord::pending(idempotency_key, request_hash, now_ms, self.ttl);
            if self
                .store
                .compare_and_swap(&store_key, None, &claim.encode()?, self.ttl)
                .await?
            {
                debug!(key = idempotency_key, "claimed idempotency key");
                return self.run_owned(store_key, claim, handler).await;
            }

            let Some(existing) = self.load(&store_key).await? else {
                // Expired or deleted between the claim attempt and the read.
                continue;
            };

            if existing.request_hash != request_hash {
                warn!(key = idempotency_key, "idempotency key reused with a different payload");
                return Err(AdmissionError::IdempotencyKeyConflict {
                    key: idempotency_key.to_string(),
                });
            }

            match existing.status {
                IdempotencyStatus::Completed => {
                    debug!(key = idempotency_key, "replaying completed response");
                    return Ok(IdempotentResponse {
                        response: existing.response(),
                        replayed: true,
                    });
                }
                IdempotencyStatus::Failed => {
                    debug!(key = idempotency_key, "replaying recorded failure");
                    return Err(existing.failure(true));
                }
                IdempotencyStatus::Pending => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(AdmissionError::PendingTimeout {
                            key: idempotency_key.to_string(),
                            waited: started.elapsed(),
                        });
                    }
                    self.wait_for_completion(&store_key, remaining.min(self.poll_interval))
                        .await;
                }
            }
        }
    }

    async fn run_owned<F, Fut>(
        &self,
        store_key: String,
        claim: IdempotencyRecord,
        handler: F,
    ) -> Result<IdempotentResponse>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<HandlerResponse>> + Send,
    {
        let mut guard = ClaimGuard {
            store: self.store.clone(),
            clock: self.clock.clone(),
            completions: self.completions.clone(),
            store_key: store_key.clone(),
            claim: Some(claim.clone()),
        };

        let outcome = handler().await;
        guard.disarm();

        let record = match &outcome {
            Ok(response) => claim.completed(response),
            Err(err) => claim.failed(failure_status(err), err.to_string()),
        };

        // The side effect already happened, so the caller gets the real
        // outcome even if it could not be recorded.
        match write_terminal(self.store.as_ref(), self.clock.as_ref(), &store_key, &record).await {
            Ok(true) => {}
            Ok(false) => warn!(
                key = %record.idempotency_key,
                "handler outlived its claim; outcome not recorded"
            ),
            Err(e) => error!(
                key = %record.idempotency_key,
                error = %e,
                "failed to record terminal state; key stays pending until it expires"
            ),
        }
        self.completions.complete(&store_key);

        match outcome {
            Ok(response) => Ok(IdempotentResponse {
                response,
                replayed: false,
            }),
            Err(_) => Err(record.failure(false)),
        }
    }

    async fn wait_for_completion(&self, store_key: &str, max_wait: Duration) {
        // The notification only covers owners in this process; the timeout
        // doubles as the poll interval for owners elsewhere.
        let notify = self.completions.subscribe(store_key);
        let _ = tokio::time::timeout(max_wait, notify.notified()).await;
        self.completions.unsubscribe(store_key, &notify);
    }

    async fn load(&self, store_key: &str) -> Result<Option<IdempotencyRecord>> {
        match self.store.get(store_key).await? {
            Some(bytes) => Ok(Some(IdempotencyRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The live record for `idempotency_key`, if any.
    pub async fn lookup(&self, idempotency_key: &str) -> Result<Option<IdempotencyRecord>> {
        self.load(&record_key(idempotency_key)).await
    }

    /// Deletes the record so the key can be claimed again.
    pub async fn forget(&self, idempotency_key: &str) -> Result<()> {
        self.store.delete(&record_key(idempotency_key)).await
    }
}
