#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use cask_bucket::TieredBufferAllocator;
use cask_core::config::{BucketConfig, CheckerConfig, SchedulerConfig};
use cask_core::{ClientUri, FetchContext, Key, KeyBlock, Metadata, PriorityClass};
use cask_resolver::{
    ArchiveError, ArchiveId, ArchiveProvider, CodecRegistry, EditionTracker, FetchFailure,
    MemoryArchiveProvider, MetadataResolver, ResolverEvent, ResolverServices, Verbosity,
};
use cask_scheduler::{BlockFailure, NetworkPort, RequestScheduler};
use cask_storage::{JobRunner, KeyStore, MemoryKeyStore, MemorySnapshotStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
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

/// Network serving blocks from its own store. Fetches wait for a permit
/// when gated.
pub struct MockNetwork {
    pub blocks: MemoryKeyStore,
    pub fetches: AtomicUsize,
    gate: Option<Semaphore>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self {
            blocks: MemoryKeyStore::new(),
            fetches: AtomicUsize::new(0),
            gate: None,
        }
    }

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
        self.blocks
            .put(block.clone())
            .await
            .map_err(|e| BlockFailure::Network(e.to_string()))
    }
}

/// Archive provider whose first `restarts` extractions fail as restartable.
/// Later extractions go to an in-memory provider.
pub struct RestartingArchives {
    pub inner: Arc<MemoryArchiveProvider>,
    pub extracts: AtomicUsize,
    restarts: usize,
}

impl RestartingArchives {
    pub fn new(restarts: usize) -> Self {
        Self {
            inner: Arc::new(MemoryArchiveProvider::new()),
            extracts: AtomicUsize::new(0),
            restarts,
        }
    }

    pub fn extract_count(&self) -> usize {
        self.extracts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArchiveProvider for RestartingArchives {
    async fn member(&self, archive: &ArchiveId, name: &str) -> Result<Option<Bytes>, ArchiveError> {
        self.inner.member(archive, name).await
    }

    async fn extract(&self, archive: &ArchiveId, body: Bytes) -> Result<(), ArchiveError> {
        let attempt = self.extracts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.restarts {
            return Err(ArchiveError::Restart(format!("attempt {attempt} raced an update")));
        }
        self.inner.extract(archive, body).await
    }
}

pub struct Harness {
    pub resolver: MetadataResolver,
    pub scheduler: RequestScheduler,
    pub store: Arc<MemoryKeyStore>,
    pub network: Arc<MockNetwork>,
    pub allocator: TieredBufferAllocator,
    pub archives: Arc<MemoryArchiveProvider>,
    pub editions: Arc<EditionTracker>,
    _temp: TempDir,
}

pub fn harness(network: MockNetwork) -> Harness {
    let archives = Arc::new(MemoryArchiveProvider::new());
    harness_with_archives(network, archives.clone(), archives)
}

/// Harness resolving archives through `port`. `archives` is the cache the
/// port extracts into.
pub fn harness_with_archives(
    network: MockNetwork,
    port: Arc<dyn ArchiveProvider>,
    archives: Arc<MemoryArchiveProvider>,
) -> Harness {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(MemoryKeyStore::new());
    let network = Arc::new(network);
    let (jobs, _worker) = JobRunner::spawn(Box::new(MemorySnapshotStore::new()));
    let scheduler = RequestScheduler::start(
        &SchedulerConfig::default(),
        &CheckerConfig::for_testing(),
        store.clone(),
        network.clone(),
        jobs,
    )
    .unwrap();
    let allocator = TieredBufferAllocator::new(BucketConfig::for_testing(temp.path())).unwrap();
    let editions = Arc::new(EditionTracker::new());
    let resolver = MetadataResolver::new(ResolverServices {
        scheduler: scheduler.clone(),
        allocator: allocator.clone(),
        archives: port,
        codecs: Arc::new(CodecRegistry::default()),
        editions: editions.clone(),
        verbosity: Verbosity {
            trace_transitions: true,
        },
        priority: PriorityClass::Interactive,
    });
    Harness {
        resolver,
        scheduler,
        store,
        network,
        allocator,
        archives,
        editions,
        _temp: temp,
    }
}

impl Harness {
    /// Store a data block locally and return its URI.
    pub async fn put_data(&self, data: impl Into<Bytes>) -> ClientUri {
        let block = KeyBlock::content(data.into(), false);
        let uri = ClientUri::from(block.key().clone());
        self.store.put(block).await.unwrap();
        uri
    }

    /// Store a metadata block locally and return its URI.
    pub async fn put_metadata(&self, metadata: &Metadata) -> ClientUri {
        let block = KeyBlock::content(metadata.to_bytes().unwrap(), true);
        let uri = ClientUri::from(block.key().clone());
        self.store.put(block).await.unwrap();
        uri
    }

    /// Resolve and read the result into memory.
    pub async fn fetch(&self, uri: ClientUri, ctx: FetchContext) -> Result<(Bytes, Option<String>), FetchFailure> {
        let result = self.resolver.resolve(uri, ctx).await?;
        let data = result.bytes().await.unwrap();
        Ok((data, result.mime_type().map(str::to_string)))
    }
}

pub fn ctx() -> FetchContext {
    FetchContext::builder().build().unwrap()
}

pub fn ctx_with_recursion(max: u32) -> FetchContext {
    FetchContext::builder().max_recursion_level(max).build().unwrap()
}

/// Collect events until the channel closes or a terminal event arrives.
pub async fn collect_events(rx: &mut mpsc::UnboundedReceiver<ResolverEvent>) -> Vec<ResolverEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(event)) => {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    return events;
                }
            }
            Ok(None) => return events,
            Err(_) => panic!("timed out waiting for resolver events"),
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
