//! Sendable requests and the events they report.

use cask_core::{GetOptions, Key, KeyBlock, PriorityClass, RequestId};
use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::mpsc;

/// Terminal failure of one block operation.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BlockFailure {
    #[error("data not found")]
    DataNotFound,

    #[error("network failure: {0}")]
    Network(String),

    #[error("block failed verification: {0}")]
    Verification(String),

    #[error("cancelled")]
    Cancelled,
}

/// Events reported to a get request.
#[derive(Clone, Debug)]
pub enum GetEvent {
    /// A wanted block arrived, from the local store or the network.
    Found(KeyBlock),
    Failed { key: Key, failure: BlockFailure },
    /// Every failure of one batch, for requests that opted in.
    BulkFailed(Vec<(Key, BlockFailure)>),
    /// Remaining keys were handed to the network.
    SentToNetwork,
}

/// Events reported to an insert request.
#[derive(Clone, Debug)]
pub enum InsertEvent {
    Inserted(Key),
    Failed { key: Key, failure: BlockFailure },
}

/// Fetch a set of keys.
#[derive(Debug)]
pub struct GetRequest {
    pub keys: Vec<Key>,
    pub options: GetOptions,
    pub events: mpsc::UnboundedSender<GetEvent>,
}

impl GetRequest {
    /// Build a request and the receiver for its events. Duplicate keys are
    /// collapsed; order of first appearance is kept.
    pub fn new(
        keys: impl IntoIterator<Item = Key>,
        options: GetOptions,
    ) -> (Self, mpsc::UnboundedReceiver<GetEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let request = Self {
            keys: dedup(keys),
            options,
            events,
        };
        (request, rx)
    }
}

/// Push a set of blocks to the network.
#[derive(Debug)]
pub struct InsertRequest {
    pub blocks: Vec<KeyBlock>,
    pub events: mpsc::UnboundedSender<InsertEvent>,
}

impl InsertRequest {
    pub fn new(
        blocks: impl IntoIterator<Item = KeyBlock>,
    ) -> (Self, mpsc::UnboundedReceiver<InsertEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let mut seen = HashSet::new();
        let blocks = blocks
            .into_iter()
            .filter(|b| seen.insert(b.key().clone()))
            .collect();
        (Self { blocks, events }, rx)
    }
}

/// One logical get or insert, decomposed by the scheduler into block
/// operations.
#[derive(Debug)]
pub enum SendableRequest {
    Get(GetRequest),
    Insert(InsertRequest),
}

impl SendableRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Get(_) => "get",
            Self::Insert(_) => "insert",
        }
    }
}

/// Returned by registration; used to cancel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestHandle {
    pub(crate) id: RequestId,
    pub(crate) priority: PriorityClass,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn priority(&self) -> PriorityClass {
        self.priority
    }
}

pub(crate) fn dedup(keys: impl IntoIterator<Item = Key>) -> Vec<Key> {
    let mut seen = HashSet::new();
    keys.into_iter().filter(|k| seen.insert(k.clone())).collect()
}
