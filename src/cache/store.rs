//! Key-value cache store abstraction and the in-memory backend.
//!
//! Stores hold JSON values so heterogeneous callers can share one backend.
//! Absence is `None`: a stored `null`, `false`, `0` or `""` is a hit.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

const SOURCE: &str = "cache::store";

/// Errors raised by a [`CacheStore`] backend or the registry holding it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    #[error("no cache store registered as `{0}`")]
    UnknownStore(String),
}

/// A shared key-value store with expiry and tag invalidation.
///
/// Implementations must be safe to share across tasks; no locking discipline
/// is imposed on callers, so concurrent writers to one key race (last write
/// wins).
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns the live value for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Stores `value` under `key`, expiring after `ttl` when given.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.set_tagged(key, value, ttl, &[]).await
    }

    /// Stores `value` under `key` and labels it with `tags` for bulk invalidation.
    async fn set_tagged(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> Result<(), StoreError>;

    /// Removes `key`, returning whether a live entry was present.
    async fn unset(&self, key: &str) -> Result<bool, StoreError>;

    /// Removes every entry carrying any of `tags`, returning how many were removed.
    async fn invalidate(&self, tags: &[String]) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
    tags: Vec<String>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

/// Process-local [`CacheStore`] backed by a `HashMap`.
///
/// Expiry uses Tokio's clock, so paused-time tests can step past a TTL.
/// Expired entries are dropped lazily on access or by [`purge_expired`](Self::purge_expired).
///
/// # Examples
///
/// ```
/// use rttp_cache::cache::{CacheStore, MemoryStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = MemoryStore::new();
/// store.set("greeting", serde_json::json!("hi"), None).await.unwrap();
/// assert_eq!(store.get("greeting").await.unwrap(), Some(serde_json::json!("hi")));
/// assert_eq!(store.get("missing").await.unwrap(), None);
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, "purge_expired");
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let now = Instant::now();
        {
            let entries = rw_read(&self.entries, "get");
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => {
                    debug!(target: "rttp_cache::store", key, outcome = "hit", "cache get");
                    return Ok(Some(entry.value.clone()));
                }
                Some(_) => {}
                None => {
                    debug!(target: "rttp_cache::store", key, outcome = "miss", "cache get");
                    return Ok(None);
                }
            }
        }

        // Expired: re-check under the write lock, a concurrent set may have refreshed it.
        let mut entries = rw_write(&self.entries, "get.expire");
        if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(key);
            debug!(target: "rttp_cache::store", key, outcome = "expired", "cache get");
            return Ok(None);
        }
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn set_tagged(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> Result<(), StoreError> {
        let entry = Entry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
            tags: tags.to_vec(),
        };
        rw_write(&self.entries, "set").insert(key.to_owned(), entry);
        debug!(target: "rttp_cache::store", key, ttl_ms = ttl.map(|t| t.as_millis() as u64), "cache set");
        Ok(())
    }

    async fn unset(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let removed = rw_write(&self.entries, "unset").remove(key);
        Ok(removed.is_some_and(|entry| entry.is_live(now)))
    }

    async fn invalidate(&self, tags: &[String]) -> Result<usize, StoreError> {
        let mut entries = rw_write(&self.entries, "invalidate");
        let before = entries.len();
        entries.retain(|_, entry| !entry.tags.iter().any(|tag| tags.contains(tag)));
        let removed = before - entries.len();
        debug!(target: "rttp_cache::store", ?tags, removed, "cache invalidate");
        Ok(removed)
    }
}

fn rw_read<'a, T>(lock: &'a RwLock<T>, op: &'static str) -> RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!(
            op,
            target_module = SOURCE,
            lock_kind = "rwlock.read",
            "Recovered from poisoned cache lock"
        );
        poisoned.into_inner()
    })
}

fn rw_write<'a, T>(lock: &'a RwLock<T>, op: &'static str) -> RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!(
            op,
            target_module = SOURCE,
            lock_kind = "rwlock.write",
            "Recovered from poisoned cache lock"
        );
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn falsy_values_are_hits() {
        let store = MemoryStore::new();
        for (key, value) in [("n", json!(null)), ("f", json!(false)), ("z", json!(0)), ("e", json!(""))] {
            store.set(key, value.clone(), None).await.unwrap();
            assert_eq!(store.get(key).await.unwrap(), Some(value));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = MemoryStore::new();
        store
            .set("k", json!(1), Some(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(store.get("k").await.unwrap(), Some(json!(1)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired() {
        let store = MemoryStore::new();
        store.set("short", json!(1), Some(Duration::from_secs(1))).await.unwrap();
        store.set("forever", json!(2), None).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn invalidate_removes_tagged_entries() {
        let store = MemoryStore::new();
        store.set_tagged("a", json!(1), None, &tags(&["users"])).await.unwrap();
        store.set_tagged("b", json!(2), None, &tags(&["users", "admin"])).await.unwrap();
        store.set_tagged("c", json!(3), None, &tags(&["posts"])).await.unwrap();

        let removed = store.invalidate(&tags(&["users"])).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("c").await.unwrap(), Some(json!(3)));
    }

    #[tokio::test]
    async fn unset_reports_presence() {
        let store = MemoryStore::new();
        store.set("k", json!("v"), None).await.unwrap();
        assert!(store.unset("k").await.unwrap());
        assert!(!store.unset("k").await.unwrap());
    }

    #[tokio::test]
    async fn set_overwrites_last_write_wins() {
        let store = MemoryStore::new();
        store.set("k", json!(1), None).await.unwrap();
        store.set("k", json!(2), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!(2)));
    }
}
