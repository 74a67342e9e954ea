//! Priority request scheduler.
//!
//! Registered requests pass the store lookahead, then wait in one random
//! selection set per priority class. The starter picks one request at a
//! time, turns its outstanding keys into a [`ChosenRequestBatch`], runs the
//! block operations against the network and, once every block finished,
//! finalizes the whole batch in a single job on the persistence queue.

use crate::batch::ChosenRequestBatch;
use crate::checker::{PendingCheck, StoreLookaheadChecker, run_checker};
use crate::entry::{BlockOutcome, EntryKind, EntryState, GetSink, Phase, RequestEntry};
use crate::error::{SchedulerError, SchedulerResult};
use crate::metrics::{BATCHES_FINISHED, BATCHES_STARTED, PENDING_TRIPS, REQUESTS_REGISTERED};
use crate::network::NetworkPort;
use crate::random_selection::RandomSelectionSet;
use crate::request::{BlockFailure, GetEvent, InsertEvent, RequestHandle, SendableRequest};
use cask_core::config::{CheckerConfig, SchedulerConfig};
use cask_core::{Key, KeyBlock, PriorityClass, RequestId};
use cask_storage::{JobRunner, KeyStore, PersistedRequest, SnapshotStore};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

type RestoredEvents = mpsc::UnboundedReceiver<(RequestId, GetEvent)>;

pub(crate) enum TripMessage {
    /// A block for which listeners may be waiting.
    Found(KeyBlock),
    /// Store check for a request is done.
    FinishRegister(Arc<RequestEntry>),
}

pub(crate) struct SchedulerInner {
    pub(crate) boot_id: Uuid,
    pub(crate) store: Arc<dyn KeyStore>,
    network: Arc<dyn NetworkPort>,
    pub(crate) jobs: JobRunner,
    pub(crate) checker: Arc<StoreLookaheadChecker>,
    selection: Mutex<Vec<RandomSelectionSet<Arc<RequestEntry>>>>,
    requests: Mutex<HashMap<RequestId, Arc<RequestEntry>>>,
    /// Persistent requests finished this boot whose snapshot removal is
    /// still queued.
    finished: Mutex<HashSet<RequestId>>,
    listeners: Mutex<HashMap<Key, Vec<Weak<RequestEntry>>>>,
    trips: mpsc::UnboundedSender<TripMessage>,
    pending_trips: AtomicUsize,
    restored_tx: mpsc::UnboundedSender<(RequestId, GetEvent)>,
    restored_rx: Mutex<Option<RestoredEvents>>,
    starter_notify: Arc<Notify>,
    permits: Arc<Semaphore>,
    registrations: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared request scheduler. Cheap to clone.
#[derive(Clone)]
pub struct RequestScheduler {
    inner: Arc<SchedulerInner>,
}

impl RequestScheduler {
    /// Build the scheduler and start its checker, trip and starter tasks.
    pub fn start(
        config: &SchedulerConfig,
        checker_config: &CheckerConfig,
        store: Arc<dyn KeyStore>,
        network: Arc<dyn NetworkPort>,
        jobs: JobRunner,
    ) -> SchedulerResult<Self> {
        config.validate().map_err(SchedulerError::Config)?;
        checker_config.validate().map_err(SchedulerError::Config)?;

        let (trips, trips_rx) = mpsc::unbounded_channel();
        let (restored_tx, restored_rx) = mpsc::unbounded_channel();
        let checker = Arc::new(StoreLookaheadChecker::new(checker_config.clone()));
        let starter_notify = Arc::new(Notify::new());

        let inner = Arc::new(SchedulerInner {
            boot_id: Uuid::new_v4(),
            store,
            network,
            jobs,
            checker: checker.clone(),
            selection: Mutex::new(
                (0..PriorityClass::COUNT)
                    .map(|_| RandomSelectionSet::new())
                    .collect(),
            ),
            requests: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashSet::new()),
            listeners: Mutex::new(HashMap::new()),
            trips,
            pending_trips: AtomicUsize::new(0),
            restored_tx,
            restored_rx: Mutex::new(Some(restored_rx)),
            starter_notify: starter_notify.clone(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_blocks)),
            registrations: AtomicUsize::new(0),
            tasks: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let handles = vec![
            tokio::spawn(run_checker(weak.clone(), checker)),
            tokio::spawn(run_trips(weak.clone(), trips_rx)),
            tokio::spawn(run_starter(weak, starter_notify, config.idle_poll())),
        ];
        *lock(&inner.tasks) = handles;

        tracing::info!(
            boot_id = %inner.boot_id,
            max_concurrent_blocks = config.max_concurrent_blocks,
            "request scheduler started"
        );
        Ok(Self { inner })
    }

    /// Register a get or insert.
    ///
    /// Gets go through the store lookahead unless they ignore the store.
    /// Persistent gets are snapshotted and survive restart.
    pub fn register_sendable(
        &self,
        request: SendableRequest,
        priority: PriorityClass,
        persistent: bool,
    ) -> SchedulerResult<RequestHandle> {
        let inner = &self.inner;
        let id = RequestId::new();
        REQUESTS_REGISTERED
            .with_label_values(&[request.kind()])
            .inc();

        let entry = match request {
            SendableRequest::Get(get) => {
                if get.keys.is_empty() {
                    return Err(SchedulerError::EmptyRequest);
                }
                let keys = crate::request::dedup(get.keys);
                Arc::new(RequestEntry::new(
                    id,
                    priority,
                    persistent,
                    keys,
                    EntryKind::Get {
                        options: get.options,
                        sink: GetSink::Channel(get.events),
                    },
                    Phase::Checking,
                ))
            }
            SendableRequest::Insert(insert) => {
                if insert.blocks.is_empty() {
                    return Err(SchedulerError::EmptyRequest);
                }
                if persistent {
                    return Err(SchedulerError::PersistentInsert);
                }
                let keys = crate::request::dedup(insert.blocks.iter().map(|b| b.key().clone()));
                let blocks = insert
                    .blocks
                    .into_iter()
                    .map(|b| (b.key().clone(), b))
                    .collect();
                Arc::new(RequestEntry::new(
                    id,
                    priority,
                    false,
                    keys,
                    EntryKind::Insert {
                        blocks,
                        events: insert.events,
                    },
                    Phase::Queued,
                ))
            }
        };

        inner.registrations.fetch_add(1, Ordering::SeqCst);
        lock(&inner.requests).insert(id, entry.clone());
        tracing::debug!(
            request = %id,
            kind = entry.kind_name(),
            priority = %priority,
            persistent,
            keys = entry.keys.len(),
            "registered request"
        );

        if let EntryKind::Insert { .. } = entry.kind {
            inner.enqueue_ready(&entry);
            return Ok(RequestHandle { id, priority });
        }

        inner.add_listeners(&entry);
        let ignore_store = entry.options().ignore_store;
        if persistent {
            let mut snapshot =
                PersistedRequest::new(id, priority, entry.keys.clone(), entry.options());
            let scheduler = inner.clone();
            let job_entry = entry.clone();
            let queued = inner.jobs.enqueue(priority, move |store| {
                if ignore_store {
                    snapshot.chosen_by = Some(scheduler.boot_id);
                }
                if let Err(e) = store.put(snapshot) {
                    tracing::error!(request = %job_entry.id, error = %e, "failed to persist request");
                }
                if ignore_store {
                    scheduler.finish_register(&job_entry, Some(store));
                } else {
                    scheduler.checker.wake();
                }
            });
            if let Err(e) = queued {
                lock(&inner.requests).remove(&id);
                inner.remove_listeners(&entry);
                return Err(e.into());
            }
        } else if ignore_store {
            inner.finish_register(&entry, None);
        } else {
            let check = PendingCheck::for_entry(entry.clone(), entry.keys.clone(), false);
            inner.checker.queue_transient(check);
        }

        Ok(RequestHandle { id, priority })
    }

    /// Cancel a request. Blocks not yet started are dropped; blocks in
    /// flight drain before the batch finalizes. No further events are
    /// reported to the request.
    pub fn cancel(&self, handle: &RequestHandle) -> bool {
        self.inner.cancel(handle.id)
    }

    /// Events for persistent requests restored after a restart. Can be
    /// taken once.
    pub fn restored_events(&self) -> Option<RestoredEvents> {
        lock(&self.inner.restored_rx).take()
    }

    /// Deliver a block to every request waiting on its key.
    pub fn trip_pending_key(&self, block: KeyBlock) {
        self.inner.trip_pending_key(block);
    }

    /// Requests registered since start.
    pub fn registration_count(&self) -> usize {
        self.inner.registrations.load(Ordering::SeqCst)
    }

    /// Requests registered and not yet finished.
    pub fn active_requests(&self) -> usize {
        lock(&self.inner.requests).len()
    }

    pub fn pending_trips(&self) -> usize {
        self.inner.pending_trips()
    }

    pub fn boot_id(&self) -> Uuid {
        self.inner.boot_id
    }

    pub fn checker(&self) -> &StoreLookaheadChecker {
        &self.inner.checker
    }

    /// Stop background tasks. Registered requests stop making progress.
    pub fn shutdown(&self) {
        self.inner.permits.close();
        for handle in lock(&self.inner.tasks).drain(..) {
            handle.abort();
        }
        tracing::info!(boot_id = %self.inner.boot_id, "request scheduler stopped");
    }
}

impl std::fmt::Debug for RequestScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScheduler")
            .field("boot_id", &self.inner.boot_id)
            .field("active_requests", &self.active_requests())
            .finish()
    }
}

impl SchedulerInner {
    pub(crate) fn pending_trips(&self) -> usize {
        self.pending_trips.load(Ordering::SeqCst)
    }

    fn push_trip(&self, message: TripMessage) {
        let pending = self.pending_trips.fetch_add(1, Ordering::SeqCst) + 1;
        PENDING_TRIPS.set(pending as i64);
        if self.trips.send(message).is_err() {
            self.pending_trips.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn trip_pending_key(&self, block: KeyBlock) {
        self.push_trip(TripMessage::Found(block));
    }

    pub(crate) fn queue_finish_register(&self, entry: Arc<RequestEntry>) {
        self.push_trip(TripMessage::FinishRegister(entry));
    }

    fn add_listeners(&self, entry: &Arc<RequestEntry>) {
        let mut listeners = lock(&self.listeners);
        for key in &entry.keys {
            listeners
                .entry(key.clone())
                .or_default()
                .push(Arc::downgrade(entry));
        }
    }

    fn remove_listeners(&self, entry: &Arc<RequestEntry>) {
        let mut listeners = lock(&self.listeners);
        for key in &entry.keys {
            if let Some(waiting) = listeners.get_mut(key) {
                waiting.retain(|w| w.upgrade().is_some_and(|e| e.id != entry.id));
                if waiting.is_empty() {
                    listeners.remove(key);
                }
            }
        }
    }

    /// Entry for a snapshot: the live one if this boot registered it,
    /// otherwise a restored entry reporting to the restored events channel.
    pub(crate) fn restore_entry(&self, snapshot: &PersistedRequest) -> Option<Arc<RequestEntry>> {
        if lock(&self.finished).contains(&snapshot.id) {
            return None;
        }
        let entry = {
            let mut requests = lock(&self.requests);
            if let Some(entry) = requests.get(&snapshot.id) {
                return Some(entry.clone());
            }
            let entry = Arc::new(RequestEntry::new(
                snapshot.id,
                snapshot.priority,
                true,
                snapshot.keys.clone(),
                EntryKind::Get {
                    options: snapshot.options,
                    sink: GetSink::Restored(snapshot.id, self.restored_tx.clone()),
                },
                Phase::Checking,
            ));
            requests.insert(snapshot.id, entry.clone());
            entry
        };
        self.add_listeners(&entry);
        tracing::info!(request = %snapshot.id, keys = snapshot.keys.len(), "restored persistent request");
        Some(entry)
    }

    fn enqueue_ready(&self, entry: &Arc<RequestEntry>) {
        lock(&self.selection)[entry.priority.index()].add(entry.clone());
        self.starter_notify.notify_one();
    }

    /// Hand a checked request on: complete it if nothing is left, fail it
    /// if it may not use the network, or queue it for the starter.
    pub(crate) fn finish_register(
        self: &Arc<Self>,
        entry: &Arc<RequestEntry>,
        store: Option<&mut dyn SnapshotStore>,
    ) {
        enum Next {
            Complete,
            FailLocal(Vec<Key>),
            Queue(Vec<Key>),
        }

        let next = {
            let mut state = entry.state();
            if state.cancelled || state.phase != Phase::Checking {
                return;
            }
            if state.outstanding.is_empty() {
                state.mark_done();
                Next::Complete
            } else if entry.options().local_only {
                let keys = entry.outstanding_keys(&state);
                state.outstanding.clear();
                state.mark_done();
                Next::FailLocal(keys)
            } else {
                state.phase = Phase::Queued;
                Next::Queue(entry.outstanding_keys(&state))
            }
        };

        match next {
            Next::Complete => self.cleanup(entry, store),
            Next::FailLocal(keys) => {
                tracing::debug!(request = %entry.id, missing = keys.len(), "local-only request missing keys");
                entry.send_failures(
                    keys.into_iter()
                        .map(|k| (k, BlockFailure::DataNotFound))
                        .collect(),
                );
                self.cleanup(entry, store);
            }
            Next::Queue(remaining) => {
                if entry.persistent
                    && let Some(store) = store
                {
                    update_snapshot(store, entry, remaining);
                }
                self.enqueue_ready(entry);
            }
        }
    }

    fn finish_register_from_check(self: &Arc<Self>, entry: Arc<RequestEntry>) {
        if !entry.persistent {
            self.finish_register(&entry, None);
            return;
        }
        let scheduler = self.clone();
        let job_entry = entry.clone();
        let queued = self.jobs.enqueue(entry.priority, move |store| {
            scheduler.finish_register(&job_entry, Some(store));
        });
        if let Err(e) = queued {
            tracing::warn!(request = %entry.id, error = %e, "job queue closed, registering without snapshot update");
            self.finish_register(&entry, None);
        }
    }

    /// Report a found block to every live request still waiting on its key.
    fn deliver_block(self: &Arc<Self>, block: &KeyBlock) {
        let waiting: Vec<Arc<RequestEntry>> = lock(&self.listeners)
            .get(block.key())
            .map(|w| w.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default();

        for entry in waiting {
            let complete = {
                let mut state = entry.state();
                if state.cancelled
                    || state.phase == Phase::Done
                    || !state.outstanding.remove(block.key())
                {
                    continue;
                }
                state.outstanding.is_empty() && state.phase == Phase::Queued && state.mark_done()
            };
            entry.send_get(GetEvent::Found(block.clone()));
            if complete {
                self.cleanup(&entry, None);
            }
        }
    }

    pub(crate) fn choose_request(&self) -> Option<Arc<RequestEntry>> {
        let mut selection = lock(&self.selection);
        for priority in PriorityClass::ALL {
            if priority == PriorityClass::Paused {
                continue;
            }
            if let Some(entry) = selection[priority.index()].remove_random() {
                return Some(entry);
            }
        }
        None
    }

    fn start_batch(self: &Arc<Self>, entry: Arc<RequestEntry>) {
        let size = {
            let mut state = entry.state();
            if state.cancelled || state.phase != Phase::Queued {
                return;
            }
            let keys = entry.outstanding_keys(&state);
            let size = keys.len();
            state.batch = Some(ChosenRequestBatch::new(keys));
            state.phase = Phase::Running;
            size
        };

        BATCHES_STARTED.inc();
        tracing::debug!(request = %entry.id, priority = %entry.priority, blocks = size, "starting batch");
        entry.send_get(GetEvent::SentToNetwork);
        tokio::spawn(run_batch(self.clone(), entry));
    }

    async fn run_block(&self, entry: &RequestEntry, key: &Key) -> BlockOutcome {
        match &entry.kind {
            EntryKind::Get { .. } => {
                if !entry.is_outstanding(key) {
                    return Err(BlockFailure::Cancelled);
                }
                let block = self.network.fetch(key).await?;
                if block.key() != key {
                    return Err(BlockFailure::Verification(format!(
                        "network returned {} for {}",
                        block.key(),
                        key
                    )));
                }
                Ok(Some(block))
            }
            EntryKind::Insert { blocks, .. } => {
                let block = blocks
                    .get(key)
                    .ok_or_else(|| BlockFailure::Network(format!("no block for {key}")))?;
                self.network.insert(block).await?;
                Ok(None)
            }
        }
    }

    fn on_block_finished(self: &Arc<Self>, entry: &Arc<RequestEntry>, key: Key, outcome: BlockOutcome) {
        let batch = {
            let mut state = entry.state();
            let Some(batch) = state.batch.as_mut() else {
                return;
            };
            if !batch.on_finished(key, outcome) {
                return;
            }
            take_for_finalization(&mut state)
        };
        if let Some(batch) = batch {
            self.schedule_finalization(entry.clone(), batch);
        }
    }

    fn schedule_finalization(
        self: &Arc<Self>,
        entry: Arc<RequestEntry>,
        batch: ChosenRequestBatch<Key, BlockOutcome>,
    ) {
        let scheduler = self.clone();
        let job_entry = entry.clone();
        // The batch moves into the job; if the queue is closed it is gone.
        let queued = self.jobs.enqueue(entry.priority, move |store| {
            scheduler.finalize_batch(&job_entry, batch, Some(store));
        });
        if let Err(e) = queued {
            tracing::error!(request = %entry.id, error = %e, "failed to queue batch finalization");
            let abandoned = entry.state().mark_done();
            if abandoned {
                self.cleanup(&entry, None);
            }
        }
    }

    /// Commit every outcome of a finished batch in one step.
    fn finalize_batch(
        self: &Arc<Self>,
        entry: &Arc<RequestEntry>,
        batch: ChosenRequestBatch<Key, BlockOutcome>,
        store: Option<&mut dyn SnapshotStore>,
    ) {
        BATCHES_FINISHED.inc();
        let dumped = batch.was_dumped();
        let cancelled = entry.state().cancelled;
        let mut failures = Vec::new();
        let mut found = 0usize;

        for (key, outcome) in batch.into_finished() {
            match outcome {
                Ok(Some(block)) => {
                    found += 1;
                    self.deliver_block(&block);
                }
                Ok(None) => {
                    if take_outstanding(entry, &key) && !cancelled {
                        entry.send_insert(InsertEvent::Inserted(key));
                    }
                }
                Err(failure) => {
                    if take_outstanding(entry, &key) && !cancelled {
                        failures.push((key, failure));
                    }
                }
            }
        }
        failures.sort_by(|a, b| a.0.cmp(&b.0));
        entry.send_failures(failures);

        tracing::debug!(request = %entry.id, found, dumped, cancelled, "finalized batch");
        if entry.state().mark_done() {
            self.cleanup(entry, store);
        }
    }

    fn cancel(self: &Arc<Self>, id: RequestId) -> bool {
        let Some(entry) = lock(&self.requests).get(&id).cloned() else {
            return false;
        };

        enum Act {
            Cleanup,
            Finalize(ChosenRequestBatch<Key, BlockOutcome>),
            Drain,
        }

        let act = {
            let mut state = entry.state();
            if state.cancelled || state.phase == Phase::Done {
                return false;
            }
            state.cancelled = true;
            match state.phase {
                Phase::Checking | Phase::Queued => {
                    state.mark_done();
                    Act::Cleanup
                }
                Phase::Running => {
                    let complete = state.batch.as_mut().is_some_and(|b| b.on_dumped());
                    match complete.then(|| take_for_finalization(&mut state)).flatten() {
                        Some(batch) => Act::Finalize(batch),
                        None => Act::Drain,
                    }
                }
                Phase::Finalizing | Phase::Done => Act::Drain,
            }
        };

        tracing::debug!(request = %id, "cancelled request");
        match act {
            Act::Cleanup => {
                lock(&self.selection)[entry.priority.index()].remove(&entry);
                self.cleanup(&entry, None);
            }
            Act::Finalize(batch) => self.schedule_finalization(entry, batch),
            Act::Drain => {}
        }
        true
    }

    /// Forget a finished request and drop its snapshot.
    fn cleanup(self: &Arc<Self>, entry: &Arc<RequestEntry>, store: Option<&mut dyn SnapshotStore>) {
        lock(&self.requests).remove(&entry.id);
        self.remove_listeners(entry);

        if !entry.persistent {
            return;
        }
        match store {
            Some(store) => remove_snapshot(store, entry.id),
            None => {
                let id = entry.id;
                lock(&self.finished).insert(id);
                let scheduler = self.clone();
                let queued = self.jobs.enqueue(entry.priority, move |store| {
                    remove_snapshot(store, id);
                    lock(&scheduler.finished).remove(&id);
                });
                if let Err(e) = queued {
                    tracing::error!(request = %id, error = %e, "failed to queue snapshot removal");
                }
            }
        }
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        for handle in lock(&self.tasks).drain(..) {
            handle.abort();
        }
    }
}

fn take_for_finalization(
    state: &mut EntryState,
) -> Option<ChosenRequestBatch<Key, BlockOutcome>> {
    state.phase = Phase::Finalizing;
    state.batch.take()
}

fn take_outstanding(entry: &RequestEntry, key: &Key) -> bool {
    entry.state().outstanding.remove(key)
}

fn remove_snapshot(store: &mut dyn SnapshotStore, id: RequestId) {
    match store.remove(&id) {
        Ok(true) => tracing::debug!(request = %id, "removed request snapshot"),
        Ok(false) => {}
        Err(e) => tracing::error!(request = %id, error = %e, "failed to remove request snapshot"),
    }
}

fn update_snapshot(store: &mut dyn SnapshotStore, entry: &RequestEntry, remaining: Vec<Key>) {
    let result = store.get(&entry.id).and_then(|snapshot| match snapshot {
        Some(mut snapshot) if snapshot.keys != remaining => {
            snapshot.keys = remaining;
            store.put(snapshot)
        }
        _ => Ok(()),
    });
    if let Err(e) = result {
        tracing::warn!(request = %entry.id, error = %e, "failed to update request snapshot");
    }
}

async fn run_trips(inner: Weak<SchedulerInner>, mut rx: mpsc::UnboundedReceiver<TripMessage>) {
    while let Some(message) = rx.recv().await {
        let Some(scheduler) = inner.upgrade() else {
            break;
        };
        match message {
            TripMessage::Found(block) => scheduler.deliver_block(&block),
            TripMessage::FinishRegister(entry) => scheduler.finish_register_from_check(entry),
        }
        let pending = scheduler.pending_trips.fetch_sub(1, Ordering::SeqCst) - 1;
        PENDING_TRIPS.set(pending as i64);
    }
}

async fn run_starter(inner: Weak<SchedulerInner>, notify: Arc<Notify>, idle: Duration) {
    loop {
        let Some(scheduler) = inner.upgrade() else {
            break;
        };
        if let Some(entry) = scheduler.choose_request() {
            scheduler.start_batch(entry);
            continue;
        }
        drop(scheduler);
        let _ = tokio::time::timeout(idle, notify.notified()).await;
    }
}

async fn run_batch(scheduler: Arc<SchedulerInner>, entry: Arc<RequestEntry>) {
    loop {
        let Ok(permit) = scheduler.permits.clone().acquire_owned().await else {
            break;
        };
        let key = {
            let mut state = entry.state();
            match state.batch.as_mut().and_then(ChosenRequestBatch::grab_not_started) {
                Some(key) => key,
                None => break,
            }
        };

        let scheduler = scheduler.clone();
        let entry = entry.clone();
        tokio::spawn(async move {
            let outcome = scheduler.run_block(&entry, &key).await;
            drop(permit);
            scheduler.on_block_finished(&entry, key, outcome);
        });
    }
}
