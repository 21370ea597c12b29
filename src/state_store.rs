//! Durable, crash-safe record of what has been uploaded.
//!
//! Persistence follows the write-temp-then-rename pattern used elsewhere
//! in this lineage for config persistence: the whole map is serialized to
//! a sibling `.tmp` file and atomically renamed over the real one, so a
//! crash mid-write never leaves a half-written `state.json` in place.

use crate::error::{AdapterError, Result};
use crate::fingerprint::Fingerprint;
use crate::path_filter::RelativePath;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Pending,
    Uploaded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub relative_path: String,
    pub size: u64,
    /// Nanoseconds since the Unix epoch, where the host filesystem
    /// provides that precision.
    pub mtime_nanos: i64,
    pub content_fingerprint: Fingerprint,
    pub upload_state: UploadState,
    pub last_upload_attempt: Option<chrono::DateTime<chrono::Utc>>,
    pub last_upload_success: Option<chrono::DateTime<chrono::Utc>>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

impl FileRecord {
    pub fn fresh(
        relative_path: &RelativePath,
        size: u64,
        mtime_nanos: i64,
        content_fingerprint: Fingerprint,
    ) -> Self {
        Self {
            relative_path: relative_path.as_str().to_string(),
            size,
            mtime_nanos,
            content_fingerprint,
            upload_state: UploadState::Pending,
            last_upload_attempt: None,
            last_upload_success: None,
            attempt_count: 0,
            last_error: None,
        }
    }

    /// True when `(size, mtime)` alone are trustworthy enough to skip a
    /// re-hash: the record must be `uploaded` with no outstanding retry
    /// history (§4.3).
    pub fn can_skip_rehash(&self) -> bool {
        self.upload_state == UploadState::Uploaded && self.attempt_count == 0
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStore {
    schema_version: u32,
    records: Vec<FileRecord>,
}

struct Inner {
    records: HashMap<String, FileRecord>,
    dirty: bool,
}

/// Single-writer, many-reader persistent map from relative path to
/// [`FileRecord`].
pub struct StateStore {
    path: PathBuf,
    inner: RwLock<Inner>,
}

impl StateStore {
    /// Opens the store at `path`, creating an empty one if it doesn't
    /// exist. A corrupt file is treated as empty (one-time recovery,
    /// logged at `warning`) per §7 rather than a fatal error.
    pub async fn open(path: PathBuf) -> Result<Arc<Self>> {
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<PersistedStore>(&contents) {
                Ok(persisted) => {
                    if persisted.schema_version > CURRENT_SCHEMA_VERSION {
                        return Err(AdapterError::StateStoreCorrupt(format!(
                            "state.json schema_version {} is newer than supported version {}",
                            persisted.schema_version, CURRENT_SCHEMA_VERSION
                        )));
                    }
                    persisted
                        .records
                        .into_iter()
                        .map(|r| (r.relative_path.clone(), r))
                        .collect()
                }
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "state.json is corrupt, starting from an empty store");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no existing state store, starting fresh");
                HashMap::new()
            }
            Err(e) => return Err(AdapterError::StateStore(e.to_string())),
        };

        info!(count = records.len(), "state store opened");

        Ok(Arc::new(Self {
            path,
            inner: RwLock::new(Inner {
                records,
                dirty: false,
            }),
        }))
    }

    pub async fn get(&self, path: &RelativePath) -> Option<FileRecord> {
        self.inner.read().await.records.get(path.as_str()).cloned()
    }

    pub async fn put(&self, record: FileRecord) {
        let mut inner = self.inner.write().await;
        inner.records.insert(record.relative_path.clone(), record);
        inner.dirty = true;
    }

    pub async fn delete(&self, path: &RelativePath) {
        let mut inner = self.inner.write().await;
        if inner.records.remove(path.as_str()).is_some() {
            inner.dirty = true;
        }
    }

    /// Snapshot of every record currently held. Writes that land after
    /// this call are not reflected.
    pub async fn iter(&self) -> Vec<FileRecord> {
        self.inner.read().await.records.values().cloned().collect()
    }

    /// Durability barrier: returns only after the current state is
    /// persisted to disk via write-temp-then-rename.
    pub async fn flush(&self) -> Result<()> {
        let (records, was_dirty) = {
            let mut inner = self.inner.write().await;
            let was_dirty = inner.dirty;
            inner.dirty = false;
            (inner.records.values().cloned().collect::<Vec<_>>(), was_dirty)
        };

        if !was_dirty {
            return Ok(());
        }

        let persisted = PersistedStore {
            schema_version: CURRENT_SCHEMA_VERSION,
            records,
        };
        let serialized = serde_json::to_vec_pretty(&persisted)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }

        let tmp_path = tmp_path_for(&self.path);
        tokio::fs::write(&tmp_path, &serialized)
            .await
            .map_err(|e| AdapterError::StateStore(format!("writing {}: {e}", tmp_path.display())))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| AdapterError::StateStore(format!("renaming into {}: {e}", self.path.display())))?;

        debug!(path = %self.path.display(), "state store flushed");
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::hash_bytes;

    fn rp(s: &str) -> RelativePath {
        RelativePath::new(Path::new(s)).unwrap()
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json")).await.unwrap();

        let record = FileRecord::fresh(&rp("case_A/notes.txt"), 3, 0, hash_bytes(b"hi\n"));
        store.put(record.clone()).await;

        let fetched = store.get(&rp("case_A/notes.txt")).await.unwrap();
        assert_eq!(fetched.content_fingerprint, record.content_fingerprint);
    }

    #[tokio::test]
    async fn flush_then_reopen_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");

        {
            let store = StateStore::open(state_path.clone()).await.unwrap();
            let mut record = FileRecord::fresh(&rp("case_A/notes.txt"), 3, 0, hash_bytes(b"hi\n"));
            record.upload_state = UploadState::Uploaded;
            store.put(record).await;
            store.flush().await.unwrap();
        }

        let reopened = StateStore::open(state_path).await.unwrap();
        let record = reopened.get(&rp("case_A/notes.txt")).await.unwrap();
        assert_eq!(record.upload_state, UploadState::Uploaded);
    }

    #[tokio::test]
    async fn corrupt_file_recovers_as_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        tokio::fs::write(&state_path, b"not json").await.unwrap();

        let store = StateStore::open(state_path).await.unwrap();
        assert!(store.iter().await.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json")).await.unwrap();
        store
            .put(FileRecord::fresh(&rp("a.txt"), 1, 0, hash_bytes(b"a")))
            .await;
        store.delete(&rp("a.txt")).await;
        assert!(store.get(&rp("a.txt")).await.is_none());
    }

    #[tokio::test]
    async fn can_skip_rehash_requires_uploaded_and_no_retries() {
        let mut record = FileRecord::fresh(&rp("a.txt"), 1, 0, hash_bytes(b"a"));
        assert!(!record.can_skip_rehash());
        record.upload_state = UploadState::Uploaded;
        assert!(record.can_skip_rehash());
        record.attempt_count = 1;
        assert!(!record.can_skip_rehash());
    }
}
