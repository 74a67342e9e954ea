//! Bucket error types.

use thiserror::Error;

/// Errors raised by temporary buckets.
#[derive(Debug, Error)]
pub enum BucketError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bucket {0} has been freed")]
    Freed(u64),

    #[error("bucket {0} already has an open writer")]
    WriterOpen(u64),

    #[error("bucket {0} has never been written")]
    NotWritten(u64),

    #[error("reader on bucket {0} was closed because the bucket was rewritten")]
    StaleReader(u64),

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<BucketError> for std::io::Error {
    fn from(e: BucketError) -> Self {
        match e {
            BucketError::Io(io) => io,
            other => std::io::Error::other(other),
        }
    }
}

/// Result type for bucket operations.
pub type BucketResult<T> = std::result::Result<T, BucketError>;
