//! The shared expiring key-value store collaborator.
//!
//! Join requests live in a store shared by every coordinator instance
//! (Redis in a clustered deployment). The contract is deliberately small
//! and only eventually consistent: callers must not rely on a `get`
//! observing a `set` from another node immediately.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use std::sync::Arc;

use ensemble_session::Clock;

use crate::after;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A string key-value store whose entries expire on their own.
pub trait ExpiringStore: Send + Sync + 'static {
    /// Writes `value`, replacing any previous value and TTL.
    fn set(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Returns whether something was deleted.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Writes `value` only if the live value is still `expected`, where
    /// `None` means "no live entry". Returns whether the write happened.
    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Deletes the entry only if its live value is still `expected`.
    fn delete_if_eq(
        &self,
        key: &str,
        expected: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Every live entry whose key starts with `prefix`.
    fn scan_prefix(
        &self,
        prefix: &str,
    ) -> impl Future<Output = Result<Vec<(String, String)>, StoreError>> + Send;
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-process [`ExpiringStore`].
///
/// Expiry is lazy: entries past their TTL are invisible to reads and are
/// removed when next touched.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of entries held, expired or not.
    pub fn raw_len(&self) -> usize {
        self.entries.len()
    }
}

impl ExpiringStore for MemoryStore {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = after(self.clock.now(), ttl);
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        if self
            .entries
            .remove_if(key, |_, e| e.expires_at <= now)
            .is_some()
        {
            return Ok(None);
        }
        Ok(self.entries.get(key).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, e)| e.expires_at > now))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let fresh = Entry {
            value,
            expires_at: after(now, ttl),
        };
        // The entry guard holds the shard lock across the read and the write.
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut slot) => {
                let current = slot.get();
                let live = (current.expires_at > now).then_some(current.value.as_str());
                if live != expected {
                    return Ok(false);
                }
                slot.insert(fresh);
            }
            MapEntry::Vacant(slot) => {
                if expected.is_some() {
                    return Ok(false);
                }
                slot.insert(fresh);
            }
        }
        Ok(true)
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove_if(key, |_, e| e.expires_at > now && e.value == expected)
            .is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let now = self.clock.now();
        self.entries.retain(|_, e| e.expires_at > now);
        let mut found: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect();
        found.sort();
        Ok(found)
    }
}
