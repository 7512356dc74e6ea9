//! Shared key-value stores used as the relay mailbox.
//!
//! A store is shared by every context that wants to see the others' events:
//! relays in one process share one `Arc<MemoryStore>`, relays in different
//! processes point at the same Redis namespace. A context's own identity lives
//! in a store only it uses, typically a `FileStore` or its own `MemoryStore`.

pub mod file_store;
pub mod redis_store;

pub use file_store::FileStore;
pub use redis_store::RedisStore;

use crate::error::SyncError;
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use log::warn;
use std::sync::atomic::{AtomicUsize, Ordering};

#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, SyncError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), SyncError>;

    async fn remove(&self, key: &str) -> Result<(), SyncError>;

    /// Writes `value` only if the current value equals `expected` (`None` meaning
    /// "absent"). Returns `Ok(false)` when another writer got there first.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, SyncError>;

    fn backend_name(&self) -> &'static str;
}

/// Process-local store. Optionally enforces a byte quota over keys and values,
/// rejecting writes that would exceed it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
    used_bytes: AtomicUsize,
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    fn check_quota(&self, key: &str, old: Option<&str>, new: &str) -> Result<(), SyncError> {
        let Some(quota) = self.quota_bytes else {
            return Ok(());
        };
        let released = old.map(|v| key.len() + v.len()).unwrap_or(0);
        let projected = self.used_bytes() - released + key.len() + new.len();
        if projected > quota {
            warn!(
                "MemoryStore quota exceeded writing '{}': {} > {} bytes",
                key, projected, quota
            );
            return Err(SyncError::StoreError(format!(
                "quota exceeded writing '{}' ({} > {} bytes)",
                key, projected, quota
            )));
        }
        Ok(())
    }

    fn account(&self, key: &str, old: Option<&str>, new: Option<&str>) {
        if let Some(old) = old {
            self.used_bytes.fetch_sub(key.len() + old.len(), Ordering::Relaxed);
        }
        if let Some(new) = new {
            self.used_bytes.fetch_add(key.len() + new.len(), Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                self.check_quota(key, Some(occupied.get().as_str()), value)?;
                let old = occupied.insert(value.to_string());
                self.account(key, Some(old.as_str()), Some(value));
            }
            Entry::Vacant(vacant) => {
                self.check_quota(key, None, value)?;
                vacant.insert(value.to_string());
                self.account(key, None, Some(value));
            }
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), SyncError> {
        if let Some((_, old)) = self.entries.remove(key) {
            self.account(key, Some(old.as_str()), None);
        }
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, SyncError> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if expected != Some(occupied.get().as_str()) {
                    return Ok(false);
                }
                self.check_quota(key, Some(occupied.get().as_str()), value)?;
                let old = occupied.insert(value.to_string());
                self.account(key, Some(old.as_str()), Some(value));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                self.check_quota(key, None, value)?;
                vacant.insert(value.to_string());
                self.account(key, None, Some(value));
                Ok(true)
            }
        }
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn set_get_remove() {
        let store = MemoryStore::new();
        assert_eq!(store.get("browser-id").await.unwrap(), None);
        store.set("browser-id", "A").await.unwrap();
        assert_eq!(store.get("browser-id").await.unwrap().as_deref(), Some("A"));
        store.remove("browser-id").await.unwrap();
        assert_eq!(store.get("browser-id").await.unwrap(), None);
        assert_eq!(store.used_bytes(), 0);
    }

    #[tokio::test]
    async fn compare_and_set_requires_matching_value() {
        let store = MemoryStore::new();
        assert!(store.compare_and_set("k", None, "v1").await.unwrap());
        assert!(!store.compare_and_set("k", None, "v2").await.unwrap());
        assert!(!store.compare_and_set("k", Some("stale"), "v2").await.unwrap());
        assert!(store.compare_and_set("k", Some("v1"), "v2").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
        assert!(!store.compare_and_set("missing", Some("v1"), "x").await.unwrap());
    }

    #[tokio::test]
    async fn quota_rejects_oversized_writes() {
        let store = MemoryStore::with_quota(10);
        store.set("k", "12345").await.unwrap();
        let err = store.set("k2", "123456789").await.unwrap_err();
        assert!(matches!(err, SyncError::StoreError(_)));
        // Overwriting frees the old value's bytes first.
        store.set("k", "123456789").await.unwrap();
        assert_eq!(store.used_bytes(), 10);
    }
}
