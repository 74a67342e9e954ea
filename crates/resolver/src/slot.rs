//! Ownership slot of one resolution.
//!
//! A resolution is a chain of steps, each holding at most one scheduler
//! registration. The slot records the current holder; moving to the next
//! step swaps the occupant and tears down the previous one in a single
//! locked operation, so cancellation only ever has one live thing to stop.

use crate::error::FetchError;
use cask_core::Key;
use cask_scheduler::{RequestHandle, RequestScheduler};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

/// What a resolution is currently doing.
#[derive(Debug)]
pub(crate) enum Occupant {
    Idle,
    /// Waiting for a single block.
    Fetching { key: Key, handle: RequestHandle },
    /// Waiting for the data blocks of a splitfile.
    Splitfile { handle: RequestHandle, blocks: usize },
    /// Control handed to a nested resolution.
    Child { purpose: &'static str },
    Finished,
}

impl Occupant {
    fn name(&self) -> &'static str {
        match self {
            Occupant::Idle => "idle",
            Occupant::Fetching { .. } => "fetching",
            Occupant::Splitfile { .. } => "splitfile",
            Occupant::Child { .. } => "child",
            Occupant::Finished => "finished",
        }
    }
}

struct SlotState {
    occupant: Occupant,
    cancelled: bool,
}

pub(crate) struct ResolutionSlot {
    scheduler: RequestScheduler,
    state: Mutex<SlotState>,
    cancel_tx: watch::Sender<bool>,
}

impl ResolutionSlot {
    pub(crate) fn new(scheduler: RequestScheduler) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            scheduler,
            state: Mutex::new(SlotState {
                occupant: Occupant::Idle,
                cancelled: false,
            }),
            cancel_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the occupant. If the resolution was cancelled the new
    /// occupant is torn down instead and `Cancelled` is returned.
    pub(crate) fn become_(&self, next: Occupant) -> Result<(), FetchError> {
        let previous = {
            let mut state = self.lock();
            if state.cancelled {
                drop(state);
                self.tear_down(next);
                return Err(FetchError::Cancelled);
            }
            tracing::trace!(from = state.occupant.name(), to = next.name(), "slot transition");
            std::mem::replace(&mut state.occupant, next)
        };
        self.tear_down(previous);
        Ok(())
    }

    /// Cancel the resolution. Returns false if it was already cancelled.
    pub(crate) fn cancel(&self) -> bool {
        let previous = {
            let mut state = self.lock();
            if state.cancelled {
                return false;
            }
            state.cancelled = true;
            std::mem::replace(&mut state.occupant, Occupant::Finished)
        };
        self.tear_down(previous);
        self.cancel_tx.send_replace(true);
        true
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Resolves once the resolution is cancelled.
    pub(crate) async fn cancelled(&self) {
        let mut rx = self.cancel_tx.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Fail with `Cancelled` if the flag is set.
    pub(crate) fn check(&self) -> Result<(), FetchError> {
        if self.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        Ok(())
    }

    fn tear_down(&self, occupant: Occupant) {
        match occupant {
            Occupant::Fetching { key, handle } => {
                if self.scheduler.cancel(&handle) {
                    tracing::debug!(%key, request_id = %handle.id(), "cancelled block fetch");
                }
            }
            Occupant::Splitfile { handle, blocks } => {
                if self.scheduler.cancel(&handle) {
                    tracing::debug!(request_id = %handle.id(), blocks, "cancelled splitfile fetch");
                }
            }
            Occupant::Idle | Occupant::Child { .. } | Occupant::Finished => {}
        }
    }
}

impl std::fmt::Debug for ResolutionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ResolutionSlot")
            .field("occupant", &state.occupant.name())
            .field("cancelled", &state.cancelled)
            .finish()
    }
}
