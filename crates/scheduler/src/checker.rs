//! Local store lookahead.
//!
//! Every get request is checked against the local store before its keys
//! are admitted to network scheduling. Checks are queued per priority in
//! two queues: transient checks come from live registrations, persistent
//! checks are loaded lazily from request snapshots and capped by key count.

use crate::entry::RequestEntry;
use crate::metrics::{CHECKER_BACKOFFS, STORE_CHECKS};
use crate::scheduler::SchedulerInner;
use cask_core::config::CheckerConfig;
use cask_core::{Key, PriorityClass};
use cask_storage::{SnapshotStore, StoreFetchOptions};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::Notify;

/// One request waiting for its keys to be checked.
pub(crate) struct PendingCheck {
    pub(crate) entry: Arc<RequestEntry>,
    pub(crate) keys: Vec<Key>,
    pub(crate) dont_cache: bool,
    pub(crate) persistent: bool,
}

impl PendingCheck {
    pub(crate) fn for_entry(entry: Arc<RequestEntry>, keys: Vec<Key>, persistent: bool) -> Self {
        let dont_cache = entry.options().dont_cache;
        Self {
            entry,
            keys,
            dont_cache,
            persistent,
        }
    }
}

/// What the checker may do given the trip queue length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backpressure {
    /// Check both transient and persistent requests.
    All,
    /// Check transient requests only.
    TransientOnly,
    /// Check nothing; back off.
    Stop,
}

#[derive(Debug)]
pub(crate) enum Admission {
    Admitted { trimmed: Vec<PendingCheck> },
    Full,
}

impl std::fmt::Debug for PendingCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCheck")
            .field("request", &self.entry.id)
            .field("keys", &self.keys.len())
            .field("persistent", &self.persistent)
            .finish()
    }
}

struct CheckQueues {
    transient: [VecDeque<PendingCheck>; PriorityClass::COUNT],
    persistent: [VecDeque<PendingCheck>; PriorityClass::COUNT],
    /// Keys held in the persistent queues.
    persistent_keys: usize,
}

/// Queues and policy of the store lookahead.
pub struct StoreLookaheadChecker {
    config: CheckerConfig,
    queues: Mutex<CheckQueues>,
    notify: Notify,
    loader_queued: AtomicBool,
}

impl StoreLookaheadChecker {
    pub fn new(config: CheckerConfig) -> Self {
        Self {
            config,
            queues: Mutex::new(CheckQueues {
                transient: std::array::from_fn(|_| VecDeque::new()),
                persistent: std::array::from_fn(|_| VecDeque::new()),
                persistent_keys: 0,
            }),
            notify: Notify::new(),
            loader_queued: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CheckQueues> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn wake(&self) {
        self.notify.notify_one();
    }

    pub(crate) fn queue_transient(&self, check: PendingCheck) {
        let priority = check.entry.priority.index();
        self.lock().transient[priority].push_back(check);
        self.wake();
    }

    /// Requests waiting in the transient queues.
    pub fn transient_len(&self) -> usize {
        self.lock().transient.iter().map(VecDeque::len).sum()
    }

    /// Keys waiting in the persistent queues.
    pub fn persistent_keys(&self) -> usize {
        self.lock().persistent_keys
    }

    pub fn backpressure(&self, pending_trips: usize) -> Backpressure {
        if pending_trips > self.config.trip_queue_high {
            Backpressure::Stop
        } else if pending_trips > self.config.trip_queue_low {
            Backpressure::TransientOnly
        } else {
            Backpressure::All
        }
    }

    /// Next check in priority order. Within a priority, transient checks
    /// go before persistent ones.
    pub(crate) fn pop_next(&self, allow_persistent: bool) -> Option<PendingCheck> {
        let mut queues = self.lock();
        for priority in 0..PriorityClass::COUNT {
            if let Some(check) = queues.transient[priority].pop_front() {
                return Some(check);
            }
            if allow_persistent && let Some(check) = queues.persistent[priority].pop_front() {
                queues.persistent_keys -= check.keys.len();
                return Some(check);
            }
        }
        None
    }

    /// Admit a loaded persistent check, trimming lower priorities if the
    /// key cap would be exceeded. Refuses when trimming cannot make room.
    pub(crate) fn admit_persistent(&self, check: PendingCheck) -> Admission {
        let cap = self.config.max_persistent_keys;
        let wanted = check.keys.len();
        let priority = check.entry.priority.index();
        let mut queues = self.lock();

        let lower: usize = queues.persistent[priority + 1..]
            .iter()
            .flat_map(|q| q.iter().map(|c| c.keys.len()))
            .sum();
        let kept = queues.persistent_keys - lower;
        // An oversized request is still admitted alone.
        if kept > 0 && kept + wanted > cap {
            return Admission::Full;
        }

        let mut trimmed = Vec::new();
        while queues.persistent_keys + wanted > cap {
            let Some(lowest) = (priority + 1..PriorityClass::COUNT)
                .rev()
                .find(|&p| !queues.persistent[p].is_empty())
            else {
                break;
            };
            if let Some(victim) = queues.persistent[lowest].pop_back() {
                queues.persistent_keys -= victim.keys.len();
                trimmed.push(victim);
            }
        }

        queues.persistent[priority].push_back(check);
        queues.persistent_keys += wanted;
        Admission::Admitted { trimmed }
    }

    /// Mark that a loader job is queued. Returns false if one already is.
    fn claim_loader(&self) -> bool {
        !self.loader_queued.swap(true, Ordering::SeqCst)
    }

    fn release_loader(&self) {
        self.loader_queued.store(false, Ordering::SeqCst);
    }
}

/// Load persistent requests not yet claimed by this boot, highest priority
/// first, until the key cap is reached. Runs on the job queue.
pub(crate) fn load_persistent(inner: &Arc<SchedulerInner>, store: &mut dyn SnapshotStore) {
    let checker = &inner.checker;
    let mut loaded = 0usize;

    'priorities: for priority in PriorityClass::ALL {
        let snapshots = match store.list_priority(priority) {
            Ok(snapshots) => snapshots,
            Err(e) => {
                tracing::warn!(priority = %priority, error = %e, "failed to list persistent requests");
                continue;
            }
        };

        for mut snapshot in snapshots {
            if snapshot.chosen_by == Some(inner.boot_id) {
                continue;
            }
            let Some(entry) = inner.restore_entry(&snapshot) else {
                continue;
            };
            if entry.is_terminal() {
                continue;
            }

            let check = PendingCheck::for_entry(entry, snapshot.keys.clone(), true);
            match checker.admit_persistent(check) {
                Admission::Full => break 'priorities,
                Admission::Admitted { trimmed } => {
                    snapshot.chosen_by = Some(inner.boot_id);
                    if let Err(e) = store.put(snapshot) {
                        tracing::warn!(error = %e, "failed to claim persistent request");
                    }
                    for victim in trimmed {
                        unclaim(store, &victim);
                    }
                    loaded += 1;
                }
            }
        }
    }

    checker.release_loader();
    if loaded > 0 {
        tracing::debug!(loaded, "loaded persistent requests for store check");
        checker.wake();
    }
}

fn unclaim(store: &mut dyn SnapshotStore, victim: &PendingCheck) {
    match store.get(&victim.entry.id) {
        Ok(Some(mut snapshot)) => {
            snapshot.chosen_by = None;
            if let Err(e) = store.put(snapshot) {
                tracing::warn!(request = %victim.entry.id, error = %e, "failed to release trimmed request");
            }
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(request = %victim.entry.id, error = %e, "failed to read trimmed request");
        }
    }
}

/// Main checker loop. Exits when the scheduler is dropped.
pub(crate) async fn run_checker(inner: Weak<SchedulerInner>, checker: Arc<StoreLookaheadChecker>) {
    loop {
        let Some(scheduler) = inner.upgrade() else {
            break;
        };

        let wait = match checker.backpressure(scheduler.pending_trips()) {
            Backpressure::Stop => {
                CHECKER_BACKOFFS.inc();
                tracing::debug!(
                    pending_trips = scheduler.pending_trips(),
                    "trip queue overloaded, store checker backing off"
                );
                checker.config.overload_backoff()
            }
            mode => {
                let allow_persistent = mode == Backpressure::All;
                if let Some(check) = checker.pop_next(allow_persistent) {
                    check_keys(&scheduler, check).await;
                    continue;
                }
                if allow_persistent {
                    queue_loader(&scheduler);
                    checker.config.idle_wait()
                } else {
                    checker.config.overload_backoff()
                }
            }
        };

        drop(scheduler);
        let _ = tokio::time::timeout(wait, checker.notify.notified()).await;
    }
    tracing::debug!("store checker stopped");
}

fn queue_loader(scheduler: &Arc<SchedulerInner>) {
    if !scheduler.checker.claim_loader() {
        return;
    }
    let inner = scheduler.clone();
    let queued = scheduler
        .jobs
        .enqueue(PriorityClass::Maximum, move |store| load_persistent(&inner, store));
    if let Err(e) = queued {
        scheduler.checker.release_loader();
        tracing::warn!(error = %e, "failed to queue persistent request loader");
    }
}

async fn check_keys(scheduler: &Arc<SchedulerInner>, check: PendingCheck) {
    let PendingCheck {
        entry,
        keys,
        dont_cache,
        ..
    } = check;
    let options = StoreFetchOptions {
        dont_promote: dont_cache,
    };

    for key in &keys {
        if entry.is_terminal() {
            return;
        }
        if !entry.is_outstanding(key) {
            continue;
        }

        let hit = if scheduler.store.probably_has(key).await {
            match scheduler.store.fetch(key, options).await {
                Ok(block) => block,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "local store lookup failed");
                    None
                }
            }
        } else {
            None
        };

        match hit {
            Some(block) => {
                STORE_CHECKS.with_label_values(&["hit"]).inc();
                scheduler.trip_pending_key(block);
            }
            None => STORE_CHECKS.with_label_values(&["miss"]).inc(),
        }
    }

    scheduler.queue_finish_register(entry);
}
