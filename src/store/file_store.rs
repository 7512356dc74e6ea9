// src/store/file_store.rs
//! Per-profile store persisted as a JSON object in a single file.
//!
//! Plays the role of a browser profile's local storage: it keeps a context's
//! identity across restarts. Access is serialized within the process only.
//! Each write goes to a sibling temp file that is then renamed over the
//! target, so readers never see a half-written file.

use super::SharedStore;
use crate::error::SyncError;
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn load(&self) -> Result<BTreeMap<String, String>, SyncError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                warn!("Profile store {} is not valid JSON: {}", self.path.display(), e);
                SyncError::ParseError(format!("Malformed profile store {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(SyncError::StoreError(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    SyncError::StoreError(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
        }
        let encoded = serde_json::to_string_pretty(entries)?;
        let staging = self.staging_path();
        tokio::fs::write(&staging, encoded).await.map_err(|e| {
            SyncError::StoreError(format!("Failed to write {}: {}", staging.display(), e))
        })?;
        tokio::fs::rename(&staging, &self.path).await.map_err(|e| {
            SyncError::StoreError(format!("Failed to replace {}: {}", self.path.display(), e))
        })?;
        debug!("Profile store {} persisted ({} keys)", self.path.display(), entries.len());
        Ok(())
    }
}

#[async_trait]
impl SharedStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries).await
    }

    async fn remove(&self, key: &str) -> Result<(), SyncError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        if entries.remove(key).is_some() {
            self.persist(&entries).await?;
        }
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, SyncError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        if entries.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries).await?;
        Ok(true)
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("reel-sync-test-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let store = FileStore::new(temp_path("profile.json"));
        assert_eq!(store.get("browser-id").await.unwrap(), None);
    }

    #[tokio::test]
    async fn values_survive_a_new_handle() {
        let path = temp_path("profile.json");
        let store = FileStore::new(path.clone());
        store.set("browser-id", "123-abc").await.unwrap();

        let reopened = FileStore::new(path.clone());
        assert_eq!(reopened.get("browser-id").await.unwrap().as_deref(), Some("123-abc"));

        reopened.remove("browser-id").await.unwrap();
        assert_eq!(store.get("browser-id").await.unwrap(), None);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn compare_and_set_against_file_contents() {
        let path = temp_path("profile.json");
        let store = FileStore::new(path.clone());
        assert!(store.compare_and_set("k", None, "v1").await.unwrap());
        assert!(!store.compare_and_set("k", None, "v2").await.unwrap());
        assert!(store.compare_and_set("k", Some("v1"), "v2").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_parse_error() {
        let path = temp_path("profile.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();
        let store = FileStore::new(path.clone());
        assert!(matches!(store.get("k").await, Err(SyncError::ParseError(_))));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn writes_replace_the_file_and_leave_no_staging_file() {
        let path = temp_path("profile.json");
        let store = FileStore::new(path.clone());
        store.set("browser-id", "1-a").await.unwrap();
        store.set("theme", "dark").await.unwrap();

        let staging = path.with_file_name("profile.json.tmp");
        assert!(!staging.exists());
        let on_disk: BTreeMap<String, String> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.len(), 2);
        assert_eq!(on_disk["browser-id"], "1-a");
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn stale_staging_file_does_not_affect_reads_or_writes() {
        let path = temp_path("profile.json");
        let store = FileStore::new(path.clone());
        store.set("browser-id", "1-a").await.unwrap();
        std::fs::write(path.with_file_name("profile.json.tmp"), "{\"trunc").unwrap();

        assert_eq!(store.get("browser-id").await.unwrap().as_deref(), Some("1-a"));
        store.set("theme", "dark").await.unwrap();
        let reopened = FileStore::new(path.clone());
        assert_eq!(reopened.get("browser-id").await.unwrap().as_deref(), Some("1-a"));
        assert_eq!(reopened.get("theme").await.unwrap().as_deref(), Some("dark"));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reads_during_concurrent_writes_always_parse() {
        let path = temp_path("profile.json");
        let store = std::sync::Arc::new(FileStore::new(path.clone()));
        store.set("browser-id", "1-a").await.unwrap();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for i in 0..30 {
                    store.set(&format!("k{}", i), "v").await.unwrap();
                }
            })
        };
        for _ in 0..30 {
            assert_eq!(store.get("browser-id").await.unwrap().as_deref(), Some("1-a"));
        }
        writer.await.unwrap();
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
