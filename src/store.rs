//! Versioned key-value state store.
//!
//! Token buckets, breaker states and behavior profiles all live behind the
//! [`StateStore`] trait so that a single-process map, a sharded in-memory
//! map or a distributed cache can back them interchangeably. Writers use
//! optimistic concurrency: read a [`Versioned`] value, compute the next
//! value, then [`StateStore::compare_and_swap`] it in. The [`update`] helper
//! wraps that loop.
//!
//! ```text
//!   get(key) ──> Versioned { version: 7, value }
//!        │
//!        v
//!   apply(value) ──> next
//!        │
//!        v
//!   compare_and_swap(key, Some(7), next) ──> Some(8)   (won)
//!                                       └──> None      (lost, retry)
//! ```

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::constants::DEFAULT_CAS_ATTEMPTS;
use crate::{Error, Result};

/// A stored value together with the version it was written at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<V> {
    /// Monotonic write version; unique across the whole store.
    pub version: u64,
    /// The stored value.
    pub value: V,
}

/// Key-value store with per-key compare-and-swap.
#[async_trait]
pub trait StateStore<V>: Send + Sync + Debug
where
    V: Clone + Send + Sync + 'static,
{
    /// Read the current value of `key`.
    async fn get(&self, key: &str) -> Result<Option<Versioned<V>>>;

    /// Unconditionally write `value`, returning the new version.
    async fn set(&self, key: &str, value: V) -> Result<u64>;

    /// Write `value` only if the current version equals `expected`
    /// (`None` meaning "key absent"). Returns the new version on success.
    async fn compare_and_swap(&self, key: &str, expected: Option<u64>, value: V)
        -> Result<Option<u64>>;

    /// Remove `key` only if it is still at `version`.
    async fn remove_if_version(&self, key: &str, version: u64) -> Result<bool>;

    /// All keys currently stored.
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Read-modify-write `key` under compare-and-swap.
///
/// `apply` receives the current value (or `None`) and returns the value to
/// store plus an output passed back to the caller. It may run several times
/// under contention, so it must not have side effects.
pub async fn update<V, T, S, F>(store: &S, key: &str, mut apply: F) -> Result<(V, T)>
where
    S: StateStore<V> + ?Sized,
    V: Clone + Send + Sync + 'static,
    F: FnMut(Option<V>) -> (V, T),
{
    for attempt in 0..DEFAULT_CAS_ATTEMPTS {
        let current = store.get(key).await?;
        let expected = current.as_ref().map(|c| c.version);
        let (next, output) = apply(current.map(|c| c.value));

        if store
            .compare_and_swap(key, expected, next.clone())
            .await?
            .is_some()
        {
            return Ok((next, output));
        }

        trace!(key, attempt, "compare-and-swap lost, retrying");
        tokio::task::yield_now().await;
    }

    Err(Error::StoreContention {
        key: key.to_string(),
        attempts: DEFAULT_CAS_ATTEMPTS,
    })
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

/// Sharded in-memory store backed by [`DashMap`].
///
/// Versions come from one store-wide counter, so a key that is removed and
/// re-created never reuses a version a stale reader might still hold.
#[derive(Debug)]
pub struct MemoryStore<V> {
    entries: DashMap<String, Versioned<V>>,
    next_version: AtomicU64,
}

impl<V> MemoryStore<V> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_version: AtomicU64::new(1),
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V> StateStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + Debug + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<Versioned<V>>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: V) -> Result<u64> {
        let version = self.bump();
        self.entries
            .insert(key.to_string(), Versioned { version, value });
        Ok(version)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: V,
    ) -> Result<Option<u64>> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if expected != Some(occupied.get().version) {
                    return Ok(None);
                }
                let version = self.bump();
                occupied.insert(Versioned { version, value });
                Ok(Some(version))
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(None);
                }
                let version = self.bump();
                vacant.insert(Versioned { version, value });
                Ok(Some(version))
            }
        }
    }

    async fn remove_if_version(&self, key: &str, version: u64) -> Result<bool> {
        Ok(self
            .entries
            .remove_if(key, |_, current| current.version == version)
            .is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.iter().map(|entry| entry.key().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_cas_on_absent_key() {
        let store: MemoryStore<u32> = MemoryStore::new();
        assert!(store.compare_and_swap("a", Some(1), 5).await.unwrap().is_none());
        let v = store.compare_and_swap("a", None, 5).await.unwrap();
        assert!(v.is_some());
        assert!(store.compare_and_swap("a", None, 6).await.unwrap().is_none());
        assert_eq!(store.get("a").await.unwrap().unwrap().value, 5);
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_version() {
        let store: MemoryStore<u32> = MemoryStore::new();
        let v1 = store.set("a", 1).await.unwrap();
        let v2 = store.compare_and_swap("a", Some(v1), 2).await.unwrap().unwrap();
        assert!(v2 > v1);
        assert!(store.compare_and_swap("a", Some(v1), 3).await.unwrap().is_none());
        assert_eq!(store.get("a").await.unwrap().unwrap().value, 2);
    }

    #[tokio::test]
    async fn test_versions_not_reused_after_remove() {
        let store: MemoryStore<u32> = MemoryStore::new();
        let old = store.set("a", 1).await.unwrap();
        assert!(store.remove_if_version("a", old).await.unwrap());
        let new = store.set("a", 1).await.unwrap();
        assert_ne!(old, new);
        assert!(store.compare_and_swap("a", Some(old), 9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_if_version_keeps_touched_entry() {
        let store: MemoryStore<u32> = MemoryStore::new();
        let seen = store.set("a", 1).await.unwrap();
        store.set("a", 2).await.unwrap();
        assert!(!store.remove_if_version("a", seen).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_serialized() {
        let store: Arc<MemoryStore<u64>> = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    update(store.as_ref(), "counter", |v| (v.unwrap_or(0) + 1, ()))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in futures::future::join_all(handles).await {
            handle.unwrap();
        }
        assert_eq!(store.get("counter").await.unwrap().unwrap().value, 400);
    }
}
