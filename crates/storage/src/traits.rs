//! Local block store port.

use crate::error::StorageResult;
use async_trait::async_trait;
use cask_core::{Key, KeyBlock};
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of stored keys.
pub type KeyStream = Pin<Box<dyn Stream<Item = StorageResult<Key>> + Send>>;

/// Options for an authoritative store lookup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreFetchOptions {
    /// Do not refresh the block's recency on a hit.
    pub dont_promote: bool,
}

/// Local block store.
///
/// The resolver and scheduler only read from it; `put` exists for insert
/// tooling and tests.
#[async_trait]
pub trait KeyStore: Send + Sync + 'static {
    /// Fast, possibly false-positive presence check.
    async fn probably_has(&self, key: &Key) -> bool;

    /// Authoritative local lookup.
    async fn fetch(&self, key: &Key, options: StoreFetchOptions)
    -> StorageResult<Option<KeyBlock>>;

    /// Store a block. Storing an existing key is a no-op.
    async fn put(&self, block: KeyBlock) -> StorageResult<()>;

    /// Stream every stored key.
    async fn list_keys(&self) -> StorageResult<KeyStream>;
}
