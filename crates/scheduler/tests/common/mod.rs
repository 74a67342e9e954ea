#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use cask_core::config::{CheckerConfig, SchedulerConfig};
use cask_core::{Key, KeyBlock};
use cask_scheduler::{BlockFailure, GetEvent, NetworkPort, RequestScheduler};
use cask_storage::{JobRunner, KeyStore, MemoryKeyStore, MemorySnapshotStore, SnapshotStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};

/// Generate deterministic test data using a seeded pseudo-random generator.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }
    Bytes::from(data)
}

pub fn content_block(seed: u64) -> KeyBlock {
    KeyBlock::content(seeded_bytes(seed, 256), false)
}

/// Network serving blocks from its own store, counting calls. Fetches wait
/// for a permit when gated.
pub struct MockNetwork {
    pub blocks: MemoryKeyStore,
    pub fetches: AtomicUsize,
    pub inserts: AtomicUsize,
    gate: Option<Semaphore>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self {
            blocks: MemoryKeyStore::new(),
            fetches: AtomicUsize::new(0),
            inserts: AtomicUsize::new(0),
            gate: None,
        }
    }

    /// Fetches block until [`MockNetwork::release`] is called.
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    pub fn release(&self, fetches: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(fetches);
        }
    }

    pub async fn serve(&self, block: KeyBlock) {
        self.blocks.put(block).await.unwrap();
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkPort for MockNetwork {
    async fn fetch(&self, key: &Key) -> Result<KeyBlock, BlockFailure> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| BlockFailure::Cancelled)?
                .forget();
        }
        match self.blocks.fetch(key, Default::default()).await {
            Ok(Some(block)) => Ok(block),
            Ok(None) => Err(BlockFailure::DataNotFound),
            Err(e) => Err(BlockFailure::Network(e.to_string())),
        }
    }

    async fn insert(&self, block: &KeyBlock) -> Result<(), BlockFailure> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.blocks
            .put(block.clone())
            .await
            .map_err(|e| BlockFailure::Network(e.to_string()))
    }
}

pub struct Harness {
    pub scheduler: RequestScheduler,
    pub store: Arc<MemoryKeyStore>,
    pub network: Arc<MockNetwork>,
    pub jobs: JobRunner,
}

pub fn harness(network: MockNetwork) -> Harness {
    harness_with(network, Box::new(MemorySnapshotStore::new()))
}

pub fn harness_with(network: MockNetwork, snapshots: Box<dyn SnapshotStore>) -> Harness {
    let store = Arc::new(MemoryKeyStore::new());
    let network = Arc::new(network);
    let (jobs, _worker) = JobRunner::spawn(snapshots);
    let scheduler = RequestScheduler::start(
        &SchedulerConfig::default(),
        &CheckerConfig::for_testing(),
        store.clone(),
        network.clone(),
        jobs.clone(),
    )
    .unwrap();
    Harness {
        scheduler,
        store,
        network,
        jobs,
    }
}

/// Receive the next event or fail after a timeout.
pub async fn next_event<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Assert no event arrives within a short window.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        panic!("unexpected event {event:?}");
    }
}

/// Skip `SentToNetwork` notifications.
pub async fn next_outcome(rx: &mut mpsc::UnboundedReceiver<GetEvent>) -> GetEvent {
    loop {
        match next_event(rx).await {
            GetEvent::SentToNetwork => continue,
            event => return event,
        }
    }
}

/// Wait until `condition` holds or fail after a timeout.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
