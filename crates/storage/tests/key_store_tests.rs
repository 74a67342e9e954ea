// Behaviour shared by every KeyStore backend.

mod common;

use cask_storage::{FilesystemKeyStore, KeyStore, MemoryKeyStore, StoreFetchOptions};
use common::content_block;
use futures::TryStreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

async fn exercise_store(store: Arc<dyn KeyStore>) {
    let blocks: Vec<_> = (0..20).map(|i| content_block(i, 100 + i as usize)).collect();

    for block in &blocks {
        assert!(!store.probably_has(block.key()).await);
        store.put(block.clone()).await.unwrap();
    }

    // Storing again is a no-op.
    store.put(blocks[0].clone()).await.unwrap();

    for block in &blocks {
        assert!(store.probably_has(block.key()).await);
        let fetched = store
            .fetch(block.key(), StoreFetchOptions::default())
            .await
            .unwrap()
            .expect("stored block must be found");
        assert_eq!(&fetched, block);
    }

    let listed: HashSet<_> = store
        .list_keys()
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    let expected: HashSet<_> = blocks.iter().map(|b| b.key().clone()).collect();
    assert_eq!(listed, expected);
}

#[tokio::test]
async fn test_memory_store_contract() {
    exercise_store(Arc::new(MemoryKeyStore::new())).await;
}

#[tokio::test]
async fn test_filesystem_store_contract() {
    let temp = TempDir::new().unwrap();
    let store = FilesystemKeyStore::new(temp.path()).await.unwrap();
    exercise_store(Arc::new(store)).await;
}

#[tokio::test]
async fn test_concurrent_puts_of_same_block() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(FilesystemKeyStore::new(temp.path()).await.unwrap());
    let block = content_block(7, 4096);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let block = block.clone();
        handles.push(tokio::spawn(async move { store.put(block).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let fetched = store
        .fetch(block.key(), StoreFetchOptions::default())
        .await
        .unwrap();
    assert_eq!(fetched, Some(block));
}
