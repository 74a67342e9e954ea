//! Local block storage and request persistence for cask.
//!
//! This crate provides:
//! - The [`KeyStore`] port with memory and filesystem backends
//! - Snapshots of persistent requests ([`PersistedRequest`])
//! - The serialized [`JobRunner`] through which snapshots are read and written

pub mod backends;
pub mod error;
pub mod jobs;
pub mod persistence;
pub mod traits;

pub use backends::{filesystem::FilesystemKeyStore, memory::MemoryKeyStore};
pub use error::{StorageError, StorageResult};
pub use jobs::{Job, JobRunner};
pub use persistence::{FileSnapshotStore, MemorySnapshotStore, PersistedRequest, SnapshotStore};
pub use traits::{KeyStore, KeyStream, StoreFetchOptions};

use cask_core::config::{PersistenceConfig, StoreConfig};
use std::sync::Arc;

/// Create a block store from configuration.
pub async fn from_config(config: &StoreConfig) -> StorageResult<Arc<dyn KeyStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryKeyStore::new())),
        StoreConfig::Filesystem { path } => {
            let store = FilesystemKeyStore::new(path).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Open the snapshot store named by configuration.
pub fn snapshot_store_from_config(
    config: &PersistenceConfig,
) -> StorageResult<Box<dyn SnapshotStore>> {
    match config {
        PersistenceConfig::Memory => Ok(Box::new(MemorySnapshotStore::new())),
        PersistenceConfig::File { path } => Ok(Box::new(FileSnapshotStore::open(path)?)),
    }
}
