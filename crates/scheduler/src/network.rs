//! Network transport port.

use crate::request::BlockFailure;
use async_trait::async_trait;
use cask_core::{Key, KeyBlock};
use cask_storage::{KeyStore, StoreFetchOptions};
use std::sync::Arc;
use tracing::instrument;

/// Moves single blocks to and from the network, with its own retries.
#[async_trait]
pub trait NetworkPort: Send + Sync + 'static {
    /// Fetch a block, or report a terminal failure.
    async fn fetch(&self, key: &Key) -> Result<KeyBlock, BlockFailure>;

    /// Publish a block.
    async fn insert(&self, block: &KeyBlock) -> Result<(), BlockFailure>;
}

/// No network at all: every fetch fails with data-not-found.
#[derive(Clone, Copy, Debug, Default)]
pub struct OfflineNetwork;

#[async_trait]
impl NetworkPort for OfflineNetwork {
    async fn fetch(&self, _key: &Key) -> Result<KeyBlock, BlockFailure> {
        Err(BlockFailure::DataNotFound)
    }

    async fn insert(&self, _block: &KeyBlock) -> Result<(), BlockFailure> {
        Err(BlockFailure::Network("offline".to_string()))
    }
}

/// A "network" backed by a block store, standing in for peers.
#[derive(Clone)]
pub struct LoopbackNetwork {
    store: Arc<dyn KeyStore>,
}

impl LoopbackNetwork {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl NetworkPort for LoopbackNetwork {
    #[instrument(skip(self), fields(network = "loopback"))]
    async fn fetch(&self, key: &Key) -> Result<KeyBlock, BlockFailure> {
        match self.store.fetch(key, StoreFetchOptions::default()).await {
            Ok(Some(block)) => Ok(block),
            Ok(None) => Err(BlockFailure::DataNotFound),
            Err(e) => Err(BlockFailure::Network(e.to_string())),
        }
    }

    #[instrument(skip(self, block), fields(network = "loopback", key = %block.key()))]
    async fn insert(&self, block: &KeyBlock) -> Result<(), BlockFailure> {
        self.store
            .put(block.clone())
            .await
            .map_err(|e| BlockFailure::Network(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use cask_storage::MemoryKeyStore;

    #[tokio::test]
    async fn test_loopback_round_trip() {
        let network = LoopbackNetwork::new(Arc::new(MemoryKeyStore::new()));
        let block = KeyBlock::content(Bytes::from_static(b"peer data"), false);

        assert_eq!(
            network.fetch(block.key()).await,
            Err(BlockFailure::DataNotFound)
        );
        network.insert(&block).await.unwrap();
        assert_eq!(network.fetch(block.key()).await, Ok(block));
    }

    #[tokio::test]
    async fn test_offline_never_finds() {
        let block = KeyBlock::content(Bytes::from_static(b"x"), false);
        assert_eq!(
            OfflineNetwork.fetch(block.key()).await,
            Err(BlockFailure::DataNotFound)
        );
        assert!(OfflineNetwork.insert(&block).await.is_err());
    }
}
