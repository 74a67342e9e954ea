//! In-memory state of a registered request.

use crate::batch::ChosenRequestBatch;
use crate::random_selection::Selectable;
use crate::request::{BlockFailure, GetEvent, InsertEvent};
use cask_core::{GetOptions, Key, KeyBlock, PriorityClass, RequestId};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Outcome of one block operation. Inserts succeed with `None`.
pub(crate) type BlockOutcome = Result<Option<KeyBlock>, BlockFailure>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Waiting for the local store check.
    Checking,
    /// Waiting in a selection set.
    Queued,
    /// Batch in flight.
    Running,
    /// Batch complete, finalization job queued.
    Finalizing,
    Done,
}

/// Where a get request's events go.
pub(crate) enum GetSink {
    Channel(mpsc::UnboundedSender<GetEvent>),
    /// Request restored from a snapshot after restart.
    Restored(RequestId, mpsc::UnboundedSender<(RequestId, GetEvent)>),
}

impl GetSink {
    pub(crate) fn send(&self, event: GetEvent) {
        // A dropped receiver means the requester stopped listening.
        match self {
            Self::Channel(tx) => {
                let _ = tx.send(event);
            }
            Self::Restored(id, tx) => {
                let _ = tx.send((*id, event));
            }
        }
    }
}

pub(crate) enum EntryKind {
    Get {
        options: GetOptions,
        sink: GetSink,
    },
    Insert {
        blocks: HashMap<Key, KeyBlock>,
        events: mpsc::UnboundedSender<InsertEvent>,
    },
}

pub(crate) struct EntryState {
    pub(crate) phase: Phase,
    /// Keys (or insert blocks) not yet reported.
    pub(crate) outstanding: HashSet<Key>,
    pub(crate) cancelled: bool,
    pub(crate) batch: Option<ChosenRequestBatch<Key, BlockOutcome>>,
}

impl EntryState {
    /// Move to `Done`. Returns false if already there.
    pub(crate) fn mark_done(&mut self) -> bool {
        if self.phase == Phase::Done {
            return false;
        }
        self.phase = Phase::Done;
        true
    }
}

pub(crate) struct RequestEntry {
    pub(crate) id: RequestId,
    pub(crate) priority: PriorityClass,
    pub(crate) persistent: bool,
    /// Keys in registration order.
    pub(crate) keys: Vec<Key>,
    pub(crate) kind: EntryKind,
    state: Mutex<EntryState>,
}

impl RequestEntry {
    pub(crate) fn new(
        id: RequestId,
        priority: PriorityClass,
        persistent: bool,
        keys: Vec<Key>,
        kind: EntryKind,
        phase: Phase,
    ) -> Self {
        let outstanding = keys.iter().cloned().collect();
        Self {
            id,
            priority,
            persistent,
            keys,
            kind,
            state: Mutex::new(EntryState {
                phase,
                outstanding,
                cancelled: false,
                batch: None,
            }),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, EntryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self.kind {
            EntryKind::Get { .. } => "get",
            EntryKind::Insert { .. } => "insert",
        }
    }

    pub(crate) fn options(&self) -> GetOptions {
        match &self.kind {
            EntryKind::Get { options, .. } => *options,
            EntryKind::Insert { .. } => GetOptions::default(),
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        let state = self.state();
        state.cancelled || state.phase == Phase::Done
    }

    pub(crate) fn is_outstanding(&self, key: &Key) -> bool {
        self.state().outstanding.contains(key)
    }

    /// Outstanding keys in registration order.
    pub(crate) fn outstanding_keys(&self, state: &EntryState) -> Vec<Key> {
        self.keys
            .iter()
            .filter(|k| state.outstanding.contains(*k))
            .cloned()
            .collect()
    }

    pub(crate) fn send_get(&self, event: GetEvent) {
        if let EntryKind::Get { sink, .. } = &self.kind {
            sink.send(event);
        }
    }

    pub(crate) fn send_insert(&self, event: InsertEvent) {
        if let EntryKind::Insert { events, .. } = &self.kind {
            let _ = events.send(event);
        }
    }

    /// Report failures, aggregated if the request opted in.
    pub(crate) fn send_failures(&self, failures: Vec<(Key, BlockFailure)>) {
        if failures.is_empty() {
            return;
        }
        match &self.kind {
            EntryKind::Get { options, sink } if options.bulk_failure => {
                sink.send(GetEvent::BulkFailed(failures));
            }
            EntryKind::Get { sink, .. } => {
                for (key, failure) in failures {
                    sink.send(GetEvent::Failed { key, failure });
                }
            }
            EntryKind::Insert { events, .. } => {
                for (key, failure) in failures {
                    let _ = events.send(InsertEvent::Failed { key, failure });
                }
            }
        }
    }
}

impl PartialEq for RequestEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RequestEntry {}

impl Hash for RequestEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Selectable for Arc<RequestEntry> {
    fn is_terminal(&self) -> bool {
        RequestEntry::is_terminal(self)
    }

    fn is_superseded(&self) -> bool {
        self.state().phase != Phase::Queued
    }
}
