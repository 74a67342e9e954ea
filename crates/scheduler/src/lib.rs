//! Request scheduling for cask.
//!
//! - [`RequestScheduler`] admits get and insert requests, checks gets
//!   against the local store, and runs the rest against the network one
//!   [`ChosenRequestBatch`] at a time
//! - [`StoreLookaheadChecker`] holds the store-check queues and their
//!   backpressure policy
//! - [`RandomSelectionSet`] picks uniformly among requests of one priority

pub mod batch;
pub mod checker;
mod entry;
pub mod error;
pub mod metrics;
pub mod network;
pub mod random_selection;
pub mod request;
pub mod scheduler;

pub use batch::ChosenRequestBatch;
pub use checker::{Backpressure, StoreLookaheadChecker};
pub use error::{SchedulerError, SchedulerResult};
pub use network::{LoopbackNetwork, NetworkPort, OfflineNetwork};
pub use random_selection::{RandomSelectionSet, Selectable};
pub use request::{
    BlockFailure, GetEvent, GetRequest, InsertEvent, InsertRequest, RequestHandle, SendableRequest,
};
pub use scheduler::RequestScheduler;
