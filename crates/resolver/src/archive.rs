//! Archive port and an in-memory implementation.
//!
//! An archive is fetched as one payload, extracted once into the
//! provider's cache, and then served member by member. Every archive has
//! an index member holding the metadata that describes its contents.

use crate::error::ArchiveError;
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use cask_core::{ArchiveKind, ClientUri, Metadata};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

/// Member holding the archive's own metadata.
pub const INDEX_MEMBER: &str = ".metadata";

/// Identifies one archive: the URI it was reached through and its format.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArchiveId {
    pub uri: ClientUri,
    pub kind: ArchiveKind,
}

/// Archive extraction and caching.
#[async_trait]
pub trait ArchiveProvider: Send + Sync {
    /// The cached index blob, or `None` if the archive is not extracted.
    async fn index(&self, archive: &ArchiveId) -> Result<Option<Bytes>, ArchiveError> {
        self.member(archive, INDEX_MEMBER).await
    }

    /// A cached member, or `None` if the archive is not extracted.
    /// Missing members of an extracted archive are
    /// [`ArchiveError::NotInArchive`].
    async fn member(&self, archive: &ArchiveId, name: &str) -> Result<Option<Bytes>, ArchiveError>;

    /// Extract a freshly fetched archive body into the cache.
    async fn extract(&self, archive: &ArchiveId, body: Bytes) -> Result<(), ArchiveError>;
}

#[derive(Serialize, Deserialize)]
struct ArchiveBody {
    members: BTreeMap<String, String>,
}

/// Pack members into a `cask` archive body. Members are stored base64
/// encoded in a JSON object.
pub fn pack_archive<I, S>(members: I) -> Result<Bytes, ArchiveError>
where
    I: IntoIterator<Item = (S, Bytes)>,
    S: Into<String>,
{
    let engine = base64::engine::general_purpose::STANDARD;
    let body = ArchiveBody {
        members: members
            .into_iter()
            .map(|(name, data)| (name.into(), engine.encode(&data)))
            .collect(),
    };
    serde_json::to_vec(&body)
        .map(Bytes::from)
        .map_err(|e| ArchiveError::Failure(format!("failed to encode archive: {e}")))
}

fn unpack_archive(body: &[u8]) -> Result<Members, ArchiveError> {
    let engine = base64::engine::general_purpose::STANDARD;
    let parsed: ArchiveBody = serde_json::from_slice(body)
        .map_err(|e| ArchiveError::Failure(format!("corrupt archive: {e}")))?;
    parsed
        .members
        .into_iter()
        .map(|(name, encoded)| {
            engine
                .decode(encoded)
                .map(|data| (name.clone(), Bytes::from(data)))
                .map_err(|e| ArchiveError::Failure(format!("corrupt member {name}: {e}")))
        })
        .collect()
}

/// Index synthesised for archives without one: every member becomes a
/// manifest entry pointing into the archive.
fn synthesise_index(members: &Members) -> Result<Bytes, ArchiveError> {
    let manifest = Metadata::simple_manifest(members.keys().map(|name| {
        (
            name.clone(),
            Metadata::ArchiveInternalRedirect {
                name: name.clone(),
                client: Default::default(),
            },
        )
    }));
    manifest
        .to_bytes()
        .map(Bytes::from)
        .map_err(|e| ArchiveError::Failure(format!("failed to build archive index: {e}")))
}

/// Archives kept extracted by [`MemoryArchiveProvider::new`].
pub const DEFAULT_CACHED_ARCHIVES: usize = 32;

type Members = HashMap<String, Bytes>;

struct ArchiveCache {
    archives: HashMap<ArchiveId, Members>,
    /// Least recently used first.
    order: VecDeque<ArchiveId>,
    capacity: usize,
}

impl ArchiveCache {
    fn touch(&mut self, archive: &ArchiveId) {
        if let Some(pos) = self.order.iter().position(|a| a == archive)
            && let Some(id) = self.order.remove(pos)
        {
            self.order.push_back(id);
        }
    }

    fn insert(&mut self, archive: ArchiveId, members: Members) {
        if self.archives.insert(archive.clone(), members).is_some() {
            self.touch(&archive);
            return;
        }
        self.order.push_back(archive);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                tracing::debug!(uri = %evicted.uri, "evicting extracted archive");
                self.archives.remove(&evicted);
            }
        }
    }

    fn remove(&mut self, archive: &ArchiveId) -> bool {
        self.order.retain(|a| a != archive);
        self.archives.remove(archive).is_some()
    }
}

/// Extracts `cask` archives into memory, keeping the most recently used
/// ones up to a fixed count.
pub struct MemoryArchiveProvider {
    cache: Mutex<ArchiveCache>,
}

impl Default for MemoryArchiveProvider {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHED_ARCHIVES)
    }
}

impl MemoryArchiveProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` archives extracted (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(ArchiveCache {
                archives: HashMap::new(),
                order: VecDeque::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Archives currently extracted.
    pub fn len(&self) -> usize {
        self.lock().archives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().archives.is_empty()
    }

    /// Drop one extracted archive. Returns whether it was cached.
    pub fn evict(&self, archive: &ArchiveId) -> bool {
        self.lock().remove(archive)
    }

    /// Drop every extracted archive.
    pub fn clear(&self) {
        let mut cache = self.lock();
        cache.archives.clear();
        cache.order.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ArchiveCache> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ArchiveProvider for MemoryArchiveProvider {
    async fn member(&self, archive: &ArchiveId, name: &str) -> Result<Option<Bytes>, ArchiveError> {
        let mut cache = self.lock();
        let Some(members) = cache.archives.get(archive) else {
            return Ok(None);
        };
        let member = members
            .get(name)
            .cloned()
            .ok_or_else(|| ArchiveError::NotInArchive(name.to_string()))?;
        cache.touch(archive);
        Ok(Some(member))
    }

    #[tracing::instrument(skip(self, body), fields(uri = %archive.uri, size = body.len()))]
    async fn extract(&self, archive: &ArchiveId, body: Bytes) -> Result<(), ArchiveError> {
        if archive.kind != ArchiveKind::Cask {
            return Err(ArchiveError::Failure(format!(
                "unsupported archive type {}",
                archive.kind.mime_type()
            )));
        }
        let mut members = unpack_archive(&body)?;
        if !members.contains_key(INDEX_MEMBER) {
            let index = synthesise_index(&members)?;
            members.insert(INDEX_MEMBER.to_string(), index);
        }
        tracing::debug!(members = members.len(), "extracted archive");
        self.lock().insert(archive.clone(), members);
        Ok(())
    }
}
