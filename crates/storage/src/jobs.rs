//! Serialized job runner over a snapshot store.
//!
//! The snapshot store is not safe for concurrent mutation, so every access
//! goes through one worker that runs jobs strictly one at a time. Queued
//! jobs are taken highest priority first, FIFO within a priority.

use crate::error::{StorageError, StorageResult};
use crate::persistence::SnapshotStore;
use cask_core::PriorityClass;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;

/// A unit of work against the snapshot store.
pub type Job = Box<dyn FnOnce(&mut dyn SnapshotStore) + Send + 'static>;

struct Queues {
    by_priority: [VecDeque<Job>; PriorityClass::COUNT],
    closed: bool,
}

impl Queues {
    fn pop(&mut self) -> Option<Job> {
        self.by_priority.iter_mut().find_map(VecDeque::pop_front)
    }
}

struct Shared {
    queues: Mutex<Queues>,
    notify: Notify,
    queued: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to the serialized job queue. Cheap to clone.
#[derive(Clone)]
pub struct JobRunner {
    shared: Arc<Shared>,
}

impl JobRunner {
    /// Start the worker task over `store`.
    pub fn spawn(store: Box<dyn SnapshotStore>) -> (Self, JoinHandle<()>) {
        let shared = Arc::new(Shared {
            queues: Mutex::new(Queues {
                by_priority: std::array::from_fn(|_| VecDeque::new()),
                closed: false,
            }),
            notify: Notify::new(),
            queued: AtomicUsize::new(0),
        });
        let store = Arc::new(Mutex::new(store));
        let handle = tokio::spawn(run_worker(shared.clone(), store));
        (Self { shared }, handle)
    }

    /// Queue a job without waiting for it.
    pub fn enqueue<F>(&self, priority: PriorityClass, job: F) -> StorageResult<()>
    where
        F: FnOnce(&mut dyn SnapshotStore) + Send + 'static,
    {
        {
            let mut queues = self.shared.lock();
            if queues.closed {
                return Err(StorageError::JobQueueClosed);
            }
            queues.by_priority[priority.index()].push_back(Box::new(job));
        }
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Queue a job and wait for its result.
    pub async fn run_blocking<F, R>(&self, priority: PriorityClass, job: F) -> StorageResult<R>
    where
        F: FnOnce(&mut dyn SnapshotStore) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(priority, move |store| {
            let _ = tx.send(job(store));
        })?;
        rx.await
            .map_err(|_| StorageError::JobFailed("job panicked or was dropped".to_string()))
    }

    /// Jobs queued or running.
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    /// Stop accepting jobs. Already queued jobs still run.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_one();
    }
}

async fn run_worker(shared: Arc<Shared>, store: Arc<Mutex<Box<dyn SnapshotStore>>>) {
    loop {
        let next = {
            let mut queues = shared.lock();
            match queues.pop() {
                Some(job) => Some(job),
                None if queues.closed => break,
                None => None,
            }
        };

        let Some(job) = next else {
            shared.notify.notified().await;
            continue;
        };

        let store = store.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            job(guard.as_mut());
        })
        .await;
        shared.queued.fetch_sub(1, Ordering::SeqCst);

        if let Err(e) = result {
            tracing::error!(error = %e, "persistence job panicked");
        }
    }
    tracing::debug!("persistence job runner stopped");
}
