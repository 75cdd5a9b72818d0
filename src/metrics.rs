use crate::coordinator::Outcome;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Clients tracked before the least recently seen one is evicted.
pub const DEFAULT_MAX_CLIENTS: usize = 10_000;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Per-client admission counters.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ClientMetrics {
    pub total_requests: u64,
    pub admitted_requests: u64,
    pub throttled_requests: u64,
    pub last_request: u64,
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self {
            total_requests: 0,
            admitted_requests: 0,
            throttled_requests: 0,
            last_request: now_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub outcomes: BTreeMap<&'static str, u64>,
    pub tracked_clients: usize,
    pub since: u64,
}

fn slot(outcome: Outcome) -> usize {
    Outcome::ALL
        .iter()
        .position(|candidate| *candidate == outcome)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct MetricsCollector {
    outcomes: Arc<[AtomicU64; Outcome::ALL.len()]>,
    client_metrics: Arc<RwLock<HashMap<String, ClientMetrics>>>,
    max_clients: usize,
    since: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            outcomes: Arc::new(std::array::from_fn(|_| AtomicU64::new(0))),
            client_metrics: Arc::new(RwLock::new(HashMap::new())),
            max_clients: DEFAULT_MAX_CLIENTS,
            since: now_secs(),
        }
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients.max(1);
        self
    }

    pub async fn record(&self, client_id: &str, outcome: Outcome) {
        self.outcomes[slot(outcome)].fetch_add(1, Ordering::Relaxed);

        let mut metrics = self.client_metrics.write().await;
        if !metrics.contains_key(client_id) && metrics.len() >= self.max_clients {
            let stalest = metrics
                .iter()
                .min_by_key(|(_, client)| client.last_request)
                .map(|(id, _)| id.clone());
            if let Some(stalest) = stalest {
                metrics.remove(&stalest);
            }
        }
        let client = metrics.entry(client_id.to_string()).or_default();
        client.total_requests += 1;
        client.last_request = now_secs();
        if outcome == Outcome::Throttled {
            client.throttled_requests += 1;
        } else {
            client.admitted_requests += 1;
        }
    }

    pub fn count(&self, outcome: Outcome) -> u64 {
        self.outcomes[slot(outcome)].load(Ordering::Relaxed)
    }

    pub async fn get_client_metrics(&self, client_id: &str) -> Option<ClientMetrics> {
        let metrics = self.client_metrics.read().await;
        metrics.get(client_id).cloned()
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let outcomes: BTreeMap<&'static str, u64> = Outcome::ALL
            .iter()
            .map(|outcome| (outcome.as_str(), self.count(*outcome)))
            .collect();

        MetricsSnapshot {
            total_requests: outcomes.values().sum(),
            outcomes,
            tracked_clients: self.client_metrics.read().await.len(),
            since: self.since,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
