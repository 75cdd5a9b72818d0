use super::{decode_counter, KeyStore};
use crate::clock::Clock;
use crate::error::{AdmissionError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: SystemTime,
}

/// In-process store for single-instance deployments and tests.
///
/// A single mutex guards the map, so each trait operation is one critical
/// section. Expired entries are dropped lazily on access and in bulk by
/// [`MemoryStore::purge_expired`].
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| AdmissionError::StoreUnavailable("memory store lock poisoned".to_string()))
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(before - entries.len())
    }

    /// Number of stored entries, including ones that expired but were not yet purged.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: SystemTime,
    ) -> Option<&'a mut Entry> {
        let expired = entries
            .get(key)
            .map(|entry| entry.expires_at <= now)
            .unwrap_or(false);
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get_mut(key)
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = self.clock.now();
        let entries = self.lock()?;
        Ok(entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new_value: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.lock()?;

        let current = Self::live(&mut entries, key, now).map(|entry| entry.value.as_slice());
        if current != expected {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: new_value.to_vec(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn increment_with_expiry(
        &self,
        key: &str,
        delta: i64,
        ttl_if_new: Duration,
    ) -> Result<i64> {
        let now = self.clock.now();
        let mut entries = self.lock()?;

        match Self::live(&mut entries, key, now) {
            Some(entry) => {
                let value = decode_counter(&entry.value)?.saturating_add(delta);
                entry.value = value.to_string().into_bytes();
                Ok(value)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: delta.to_string().into_bytes(),
                        expires_at: now + ttl_if_new,
                    },
                );
                Ok(delta)
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.lock()?;
        entries.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
