//! Process-local window counter store.
//!
//! Mirrors the semantics of the Redis store for single-instance deployments
//! and tests. Expired entries are dropped lazily when touched, or in bulk by
//! [`InMemoryStore::purge_expired`].

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::{Duration, Instant};

use super::store::{StoreError, WindowStore};

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: Instant,
}

impl CounterEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// A [`WindowStore`] backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<String, CounterEntry>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired counter.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.is_live(now));
    }

    /// Number of stored counters, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn live_entry(&self, key: &str) -> Option<CounterEntry> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live(now) {
                return Some(*entry);
            }
        }
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        None
    }
}

#[async_trait]
impl WindowStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.live_entry(key).map(|entry| entry.count))
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: u64,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        let expires_at = Instant::now()
            .checked_add(Duration::from_secs(ttl_secs))
            .ok_or_else(|| StoreError::Protocol(format!("expiry of {}s is out of range", ttl_secs)))?;
        let entry = CounterEntry {
            count: value,
            expires_at,
        };
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<(), StoreError> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.is_live(now) {
                entry.count += 1;
            }
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<u64, StoreError> {
        let Some(entry) = self.live_entry(key) else {
            return Ok(0);
        };
        let remaining = entry.expires_at.saturating_duration_since(Instant::now());
        // Round up so a live key never reports zero.
        let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        Ok(secs)
    }
}
