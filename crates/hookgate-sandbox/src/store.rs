//! Shared counter store: the cross-process state behind the sandbox and the
//! circuit breaker.
//!
//! Worker processes are stateless between requests, so rate-limit counters,
//! circuit records and block records all live behind [`SharedCounterStore`].
//! Production deployments implement it against a distributed cache; the
//! [`InMemoryStore`] serves single-process hosts and tests.
//!
//! # Expiry
//!
//! Entries carry an optional TTL and expire passively: an expired entry is
//! indistinguishable from an absent one on every operation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

/// Errors returned by [`SharedCounterStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("shared store unavailable: {0}")]
    Unavailable(String),
    /// `increment` was applied to a value that is not an integer.
    #[error("value at '{key}' is not an integer")]
    NotAnInteger {
        /// The offending key.
        key: String,
    },
    /// A stored record could not be decoded.
    #[error("failed to decode stored value: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Atomic key/value operations with TTL expiry.
///
/// Implementations must make `increment` and `compare_and_swap` atomic with
/// respect to every other caller of the same store, including callers in
/// other processes.
#[async_trait::async_trait]
pub trait SharedCounterStore: Send + Sync {
    /// Read the value under `key`. Expired entries read as `None`.
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Unconditionally write `value`, replacing any TTL with `ttl`.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Remove `key`. Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically add one and return the new value.
    ///
    /// When the key is absent it is created with value 1 and the given TTL.
    /// An existing entry keeps its original TTL (fixed window semantics).
    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64, StoreError>;

    /// Atomically replace the value under `key` with `new` if the current
    /// value equals `expected` (`None` = key absent). Returns whether the swap
    /// happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Live keys starting with `prefix`, in unspecified order.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

struct StoreEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl StoreEntry {
    /// A TTL too large to represent as an `Instant` never expires.
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Process-local [`SharedCounterStore`] backed by a mutex-guarded map.
#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, StoreEntry>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry. Reads already ignore them; this only
    /// reclaims memory.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired());
        before - entries.len()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().values().filter(|e| !e.is_expired()).count()
    }

    /// True when there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live<'a>(entries: &'a HashMap<String, StoreEntry>, key: &str) -> Option<&'a StoreEntry> {
        entries.get(key).filter(|e| !e.is_expired())
    }
}

#[async_trait::async_trait]
impl SharedCounterStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let entries = self.entries.lock();
        Ok(Self::live(&entries, key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.entries
            .lock()
            .insert(key.to_string(), StoreEntry::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed = self.entries.lock().remove(key);
        Ok(removed.is_some_and(|e| !e.is_expired()))
    }

    async fn increment(&self, key: &str, ttl: Option<Duration>) -> Result<i64, StoreError> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                let current = entry.value.as_i64().ok_or_else(|| StoreError::NotAnInteger {
                    key: key.to_string(),
                })?;
                let next = current.saturating_add(1);
                entry.value = Value::from(next);
                Ok(next)
            }
            _ => {
                entries.insert(key.to_string(), StoreEntry::new(Value::from(1), ttl));
                Ok(1)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        let current = Self::live(&entries, key).map(|e| &e.value);
        if current != expected {
            return Ok(false);
        }
        entries.insert(key.to_string(), StoreEntry::new(new, ttl));
        Ok(true)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired())
            .map(|(k, _)| k.clone())
            .collect())
    }
}
