//! Scheduler error types.

use cask_core::RequestId;
use cask_storage::StorageError;
use thiserror::Error;

/// Errors raised when registering or managing requests.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("request has no keys or blocks")]
    EmptyRequest,

    #[error("insert requests cannot be persistent")]
    PersistentInsert,

    #[error("request {0} is not registered")]
    UnknownRequest(RequestId),

    #[error("scheduler has shut down")]
    ShutDown,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for scheduler operations.
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
