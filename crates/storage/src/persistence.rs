//! Snapshots of persistent requests.
//!
//! Persisted state is plain value structs. Jobs load a snapshot, compute,
//! and write an updated snapshot back; nothing is mutated in place.

use crate::error::{StorageError, StorageResult};
use cask_core::{GetOptions, Key, PriorityClass, RequestId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use uuid::Uuid;

/// Snapshot of a persistent get request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRequest {
    pub id: RequestId,
    pub priority: PriorityClass,
    /// Keys still outstanding.
    pub keys: Vec<Key>,
    pub options: GetOptions,
    /// Boot that has claimed this request for a store check, if any.
    #[serde(default)]
    pub chosen_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub queued_at: OffsetDateTime,
}

impl PersistedRequest {
    pub fn new(id: RequestId, priority: PriorityClass, keys: Vec<Key>, options: GetOptions) -> Self {
        Self {
            id,
            priority,
            keys,
            options,
            chosen_by: None,
            queued_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Storage for request snapshots. Only ever touched from the job runner.
pub trait SnapshotStore: Send + 'static {
    fn get(&self, id: &RequestId) -> StorageResult<Option<PersistedRequest>>;

    /// Insert or replace a snapshot.
    fn put(&mut self, request: PersistedRequest) -> StorageResult<()>;

    /// Remove a snapshot, returning whether it existed.
    fn remove(&mut self, id: &RequestId) -> StorageResult<bool>;

    /// Snapshots at `priority`, oldest first.
    fn list_priority(&self, priority: PriorityClass) -> StorageResult<Vec<PersistedRequest>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Snapshots held in memory.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    requests: BTreeMap<RequestId, PersistedRequest>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_age(mut requests: Vec<PersistedRequest>) -> Vec<PersistedRequest> {
    requests.sort_by_key(|r| r.queued_at);
    requests
}

impl SnapshotStore for MemorySnapshotStore {
    fn get(&self, id: &RequestId) -> StorageResult<Option<PersistedRequest>> {
        Ok(self.requests.get(id).cloned())
    }

    fn put(&mut self, request: PersistedRequest) -> StorageResult<()> {
        self.requests.insert(request.id, request);
        Ok(())
    }

    fn remove(&mut self, id: &RequestId) -> StorageResult<bool> {
        Ok(self.requests.remove(id).is_some())
    }

    fn list_priority(&self, priority: PriorityClass) -> StorageResult<Vec<PersistedRequest>> {
        Ok(sorted_by_age(
            self.requests
                .values()
                .filter(|r| r.priority == priority)
                .cloned()
                .collect(),
        ))
    }

    fn len(&self) -> usize {
        self.requests.len()
    }
}

/// Snapshots written through to a JSON file on every change.
pub struct FileSnapshotStore {
    path: PathBuf,
    inner: MemorySnapshotStore,
}

impl FileSnapshotStore {
    /// Open `path`, loading existing snapshots if the file exists.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let requests = match std::fs::read(&path) {
            Ok(data) => {
                let list: Vec<PersistedRequest> = serde_json::from_slice(&data)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                list.into_iter().map(|r| (r.id, r)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StorageError::Io(e)),
        };
        Ok(Self {
            path,
            inner: MemorySnapshotStore { requests },
        })
    }

    fn flush(&self) -> StorageResult<()> {
        let list: Vec<&PersistedRequest> = self.inner.requests.values().collect();
        let data =
            serde_json::to_vec_pretty(&list).map_err(|e| StorageError::Serialization(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = self.path.with_extension(format!("tmp.{}", Uuid::new_v4()));
        std::fs::write(&temp_path, &data)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn get(&self, id: &RequestId) -> StorageResult<Option<PersistedRequest>> {
        self.inner.get(id)
    }

    fn put(&mut self, request: PersistedRequest) -> StorageResult<()> {
        self.inner.put(request)?;
        self.flush()
    }

    fn remove(&mut self, id: &RequestId) -> StorageResult<bool> {
        let existed = self.inner.remove(id)?;
        if existed {
            self.flush()?;
        }
        Ok(existed)
    }

    fn list_priority(&self, priority: PriorityClass) -> StorageResult<Vec<PersistedRequest>> {
        self.inner.list_priority(priority)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use cask_core::KeyBlock;
    use tempfile::TempDir;

    fn request(priority: PriorityClass) -> PersistedRequest {
        let key = KeyBlock::content(Bytes::from_static(b"k"), false).key().clone();
        PersistedRequest::new(RequestId::new(), priority, vec![key], GetOptions::default())
    }

    #[test]
    fn test_memory_store_filters_by_priority() {
        let mut store = MemorySnapshotStore::new();
        store.put(request(PriorityClass::Bulk)).unwrap();
        store.put(request(PriorityClass::Bulk)).unwrap();
        store.put(request(PriorityClass::Interactive)).unwrap();

        assert_eq!(store.list_priority(PriorityClass::Bulk).unwrap().len(), 2);
        assert_eq!(store.list_priority(PriorityClass::Interactive).unwrap().len(), 1);
        assert!(store.list_priority(PriorityClass::Paused).unwrap().is_empty());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("requests.json");

        let kept = request(PriorityClass::Update);
        let dropped = request(PriorityClass::Update);
        {
            let mut store = FileSnapshotStore::open(&path).unwrap();
            store.put(kept.clone()).unwrap();
            store.put(dropped.clone()).unwrap();
            assert!(store.remove(&dropped.id).unwrap());
            assert!(!store.remove(&dropped.id).unwrap());
        }

        let store = FileSnapshotStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&kept.id).unwrap(), Some(kept));
    }
}
