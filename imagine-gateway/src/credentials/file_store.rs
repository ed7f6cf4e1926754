//! Local JSON file backend.
//!
//! Layout:
//!
//! ```json
//! {
//!   "last_reset": 1700000000,
//!   "current_index": 4,
//!   "usage": {
//!     "<key>": {"count": 1, "last_used": 0, "first_used": 0, "failed": false, "age_verified": false}
//!   }
//! }
//! ```
//!
//! The document is rewritten after every mutation. Write failures are
//! logged and the in-memory state stays authoritative.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::CredentialError;
use super::store::{CredentialStore, StoreSnapshot};
use super::types::{UsageRecord, de_timestamp};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default, deserialize_with = "de_timestamp")]
    last_reset: i64,
    #[serde(default)]
    current_index: u64,
    #[serde(default)]
    usage: BTreeMap<String, UsageRecord>,
}

/// Usage store persisted to a single JSON document.
pub struct FileCredentialStore {
    path: PathBuf,
    state: Mutex<StateDocument>,
}

impl FileCredentialStore {
    /// Open the store, loading an existing document if present.
    ///
    /// An unreadable or corrupt document is logged and replaced by an empty state.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CredentialError> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<StateDocument>(&bytes) {
                Ok(state) => {
                    info!(
                        path = %path.display(),
                        records = state.usage.len(),
                        "Loaded credential state"
                    );
                    state
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse credential state, starting fresh");
                    StateDocument::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateDocument::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read credential state, starting fresh");
                StateDocument::default()
            }
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut StateDocument),
    {
        let encoded = {
            let mut state = self.state.lock();
            f(&mut state);
            serde_json::to_vec_pretty(&*state)
        };

        match encoded {
            Ok(bytes) => self.write(&bytes).await,
            Err(e) => warn!(error = %e, "Failed to encode credential state"),
        }
    }

    async fn write(&self, bytes: &[u8]) {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            warn!(path = %parent.display(), error = %e, "Failed to create state directory");
            return;
        }

        let tmp = self.path.with_extension("json.tmp");
        let result = async {
            tokio::fs::write(&tmp, bytes).await?;
            tokio::fs::rename(&tmp, &self.path).await
        }
        .await;

        match result {
            Ok(()) => debug!(path = %self.path.display(), "Saved credential state"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to save credential state"),
        }
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn sync_keys(&self, keys: &[String], now: i64) -> Result<(), CredentialError> {
        self.update(|state| {
            state.usage.retain(|key, _| keys.contains(key));
            for key in keys {
                state
                    .usage
                    .entry(key.clone())
                    .or_insert_with(|| UsageRecord::first_seen(now));
            }
        })
        .await;
        Ok(())
    }

    async fn snapshot(&self, keys: &[String]) -> Result<StoreSnapshot, CredentialError> {
        let state = self.state.lock();
        Ok(StoreSnapshot {
            last_reset: state.last_reset,
            cursor: state.current_index,
            usage: keys
                .iter()
                .filter_map(|key| state.usage.get(key).map(|record| (key.clone(), *record)))
                .collect(),
        })
    }

    async fn incr_usage(&self, key: &str, now: i64) -> Result<(), CredentialError> {
        self.update(|state| {
            let record = state
                .usage
                .entry(key.to_string())
                .or_insert_with(|| UsageRecord::first_seen(now));
            record.count += 1;
            record.last_used = now;
        })
        .await;
        Ok(())
    }

    async fn set_failed(&self, key: &str, failed: bool) -> Result<(), CredentialError> {
        self.update(|state| {
            state.usage.entry(key.to_string()).or_default().failed = failed;
        })
        .await;
        Ok(())
    }

    async fn set_age_verified(&self, key: &str, verified: bool) -> Result<(), CredentialError> {
        self.update(|state| {
            state.usage.entry(key.to_string()).or_default().age_verified = verified;
        })
        .await;
        Ok(())
    }

    async fn advance_cursor(&self) -> Result<u64, CredentialError> {
        let mut previous = 0;
        self.update(|state| {
            previous = state.current_index;
            state.current_index = state.current_index.wrapping_add(1);
        })
        .await;
        Ok(previous)
    }

    async fn start_window(&self, now: i64) -> Result<(), CredentialError> {
        self.update(|state| state.last_reset = now).await;
        Ok(())
    }

    async fn reset_usage(&self, keys: &[String], now: i64) -> Result<(), CredentialError> {
        self.update(|state| {
            for key in keys {
                if let Some(record) = state.usage.get_mut(key) {
                    record.count = 0;
                    record.failed = false;
                }
            }
            state.last_reset = now;
        })
        .await;
        Ok(())
    }

    async fn clear_failed(&self, keys: &[String]) -> Result<(), CredentialError> {
        self.update(|state| {
            for key in keys {
                if let Some(record) = state.usage.get_mut(key) {
                    record.failed = false;
                }
            }
        })
        .await;
        Ok(())
    }

    async fn close(&self) -> Result<(), CredentialError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_state_round_trips_through_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sso_state.json");
        let all = keys(&["k1", "k2"]);

        let store = FileCredentialStore::open(&path).await.unwrap();
        store.sync_keys(&all, 100).await.unwrap();
        store.start_window(100).await.unwrap();
        store.incr_usage("k1", 150).await.unwrap();
        store.set_failed("k2", true).await.unwrap();
        store.set_age_verified("k1", true).await.unwrap();
        store.advance_cursor().await.unwrap();
        let before = store.snapshot(&all).await.unwrap();

        let reopened = FileCredentialStore::open(&path).await.unwrap();
        let after = reopened.snapshot(&all).await.unwrap();

        assert_eq!(before, after);
        assert_eq!(after.last_reset, 100);
        assert_eq!(after.cursor, 1);
        let k1 = after.usage_of("k1");
        assert_eq!((k1.count, k1.last_used, k1.first_used), (1, 150, 100));
        assert!(k1.age_verified);
        assert!(after.usage_of("k2").failed);
    }

    #[tokio::test]
    async fn test_sync_preserves_existing_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path().join("state.json"))
            .await
            .unwrap();

        store.sync_keys(&keys(&["k1", "k2"]), 100).await.unwrap();
        store.incr_usage("k1", 120).await.unwrap();
        store.sync_keys(&keys(&["k1", "k3"]), 200).await.unwrap();

        let snapshot = store.snapshot(&keys(&["k1", "k2", "k3"])).await.unwrap();
        assert_eq!(snapshot.usage_of("k1").count, 1);
        assert_eq!(snapshot.usage_of("k1").first_used, 100);
        assert_eq!(snapshot.usage_of("k3").first_used, 200);
        assert!(!snapshot.usage.contains_key("k2"));
    }

    #[tokio::test]
    async fn test_reset_usage() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::open(dir.path().join("state.json"))
            .await
            .unwrap();
        let all = keys(&["k1", "k2"]);
        store.sync_keys(&all, 0).await.unwrap();
        store.incr_usage("k1", 10).await.unwrap();
        store.set_failed("k2", true).await.unwrap();

        store.reset_usage(&all, 500).await.unwrap();

        let snapshot = store.snapshot(&all).await.unwrap();
        assert_eq!(snapshot.last_reset, 500);
        assert_eq!(snapshot.usage_of("k1").count, 0);
        assert_eq!(snapshot.usage_of("k1").last_used, 10);
        assert!(!snapshot.usage_of("k2").failed);
    }

    #[tokio::test]
    async fn test_loads_legacy_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sso_state.json");
        tokio::fs::write(
            &path,
            r#"{
                "last_reset": 1700000000.5,
                "current_index": 2,
                "usage": {
                    "abc123abc123": {"count": 4, "last_used": 1700000100.2, "first_used": 1699999999.0, "failed": true, "age_verified": 1}
                }
            }"#,
        )
        .await
        .unwrap();

        let store = FileCredentialStore::open(&path).await.unwrap();
        let snapshot = store.snapshot(&keys(&["abc123abc123"])).await.unwrap();
        assert_eq!(snapshot.last_reset, 1_700_000_000);
        assert_eq!(snapshot.cursor, 2);
        let record = snapshot.usage_of("abc123abc123");
        assert_eq!(record.count, 4);
        assert!(record.failed);
        assert!(record.age_verified);
    }

    #[tokio::test]
    async fn test_corrupt_document_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sso_state.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let store = FileCredentialStore::open(&path).await.unwrap();
        assert_eq!(store.snapshot(&[]).await.unwrap(), StoreSnapshot::default());
    }

    #[tokio::test]
    async fn test_write_failure_keeps_memory_state() {
        let dir = tempfile::tempdir().unwrap();
        // The target path is a directory, so every write fails
        let store = FileCredentialStore::open(dir.path()).await.unwrap();

        store.incr_usage("k1", 10).await.unwrap();
        assert_eq!(store.snapshot(&keys(&["k1"])).await.unwrap().usage_of("k1").count, 1);
    }
}
