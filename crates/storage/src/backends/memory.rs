//! In-memory block store.

use crate::error::StorageResult;
use crate::traits::{KeyStore, KeyStream, StoreFetchOptions};
use async_trait::async_trait;
use cask_core::{Key, KeyBlock};
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

struct Entry {
    block: KeyBlock,
    last_access: u64,
}

/// Block store held entirely in memory.
#[derive(Default)]
pub struct MemoryKeyStore {
    blocks: RwLock<HashMap<Key, Entry>>,
    clock: AtomicU64,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logical access time of a key, if stored. Larger is more recent.
    pub fn last_access(&self, key: &Key) -> Option<u64> {
        let blocks = self.blocks.read().ok()?;
        blocks.get(key).map(|e| e.last_access)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn probably_has(&self, key: &Key) -> bool {
        self.blocks
            .read()
            .map(|b| b.contains_key(key))
            .unwrap_or(false)
    }

    async fn fetch(
        &self,
        key: &Key,
        options: StoreFetchOptions,
    ) -> StorageResult<Option<KeyBlock>> {
        let now = self.tick();
        let mut blocks = self
            .blocks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(blocks.get_mut(key).map(|entry| {
            if !options.dont_promote {
                entry.last_access = now;
            }
            entry.block.clone()
        }))
    }

    async fn put(&self, block: KeyBlock) -> StorageResult<()> {
        let now = self.tick();
        let mut blocks = self
            .blocks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        blocks.entry(block.key().clone()).or_insert(Entry {
            block,
            last_access: now,
        });
        Ok(())
    }

    async fn list_keys(&self) -> StorageResult<KeyStream> {
        let keys: Vec<Key> = self
            .blocks
            .read()
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default();
        Ok(Box::pin(futures::stream::iter(keys.into_iter().map(Ok))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_put_fetch() {
        let store = MemoryKeyStore::new();
        let block = KeyBlock::content(Bytes::from_static(b"abc"), false);
        store.put(block.clone()).await.unwrap();

        assert!(store.probably_has(block.key()).await);
        let fetched = store
            .fetch(block.key(), StoreFetchOptions::default())
            .await
            .unwrap();
        assert_eq!(fetched, Some(block));
    }

    #[tokio::test]
    async fn test_dont_promote_leaves_access_time() {
        let store = MemoryKeyStore::new();
        let block = KeyBlock::content(Bytes::from_static(b"abc"), false);
        store.put(block.clone()).await.unwrap();
        let before = store.last_access(block.key()).unwrap();

        let opts = StoreFetchOptions { dont_promote: true };
        store.fetch(block.key(), opts).await.unwrap();
        assert_eq!(store.last_access(block.key()), Some(before));

        store
            .fetch(block.key(), StoreFetchOptions::default())
            .await
            .unwrap();
        assert!(store.last_access(block.key()).unwrap() > before);
    }

    #[tokio::test]
    async fn test_missing_key() {
        let store = MemoryKeyStore::new();
        let block = KeyBlock::content(Bytes::from_static(b"abc"), false);
        assert!(!store.probably_has(block.key()).await);
        assert!(
            store
                .fetch(block.key(), StoreFetchOptions::default())
                .await
                .unwrap()
                .is_none()
        );
    }
}
