//! Resolver error taxonomy.

use cask_bucket::BucketError;
use cask_core::{ClientUri, CompressionCodec};
use cask_scheduler::BlockFailure;
use thiserror::Error;

/// Where surplus path components came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathOrigin {
    /// Supplied by the caller in the requested URI.
    Caller,
    /// Introduced by a redirect target.
    Redirect,
}

/// Why a resolution failed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("too much recursion: level {level} exceeds {max}")]
    TooMuchRecursion { level: u32, max: u32 },

    #[error("too many path components ({origin:?})")]
    TooManyPathComponents {
        origin: PathOrigin,
        /// The URI with the surplus components removed.
        suggested: Option<ClientUri>,
    },

    #[error("not enough path components")]
    NotEnoughPathComponents { suggested: Option<ClientUri> },

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("unknown metadata: {0}")]
    UnknownMetadata(String),

    #[error("archive failure: {message}")]
    ArchiveFailure { restartable: bool, message: String },

    #[error("not in archive: {0}")]
    NotInArchive(String),

    #[error("too big: size {size:?}, metadata {metadata}")]
    TooBig {
        size: Option<u64>,
        /// The oversized item was a metadata blob.
        metadata: bool,
    },

    #[error("wrong mime type: {0}")]
    WrongMimeType(String),

    #[error("bucket error: {0}")]
    Bucket(#[from] BucketError),

    #[error("block fetch failed: {0}")]
    BlockFetch(BlockFailure),

    #[error("invalid uri: {0}")]
    InvalidUri(String),

    #[error("cancelled")]
    Cancelled,

    #[error("permanent redirect to {uri}")]
    PermanentRedirect { uri: ClientUri },

    #[error("internal error: {0}")]
    Internal(String),
}

impl FetchError {
    /// Whether retrying the same request later may succeed.
    pub fn is_restartable(&self) -> bool {
        match self {
            FetchError::ArchiveFailure { restartable, .. } => *restartable,
            FetchError::BlockFetch(failure) => {
                matches!(failure, BlockFailure::DataNotFound | BlockFailure::Network(_))
            }
            FetchError::Bucket(_) => true,
            _ => false,
        }
    }

    /// Log and build an invariant violation.
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(error = %message, "resolver invariant violated");
        FetchError::Internal(message)
    }
}

/// Terminal failure of a resolution as reported to the caller.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct FetchFailure {
    #[source]
    pub error: FetchError,
    /// `expected_size` is the final size of the data, not an estimate.
    pub size_finalized: bool,
    pub expected_size: Option<u64>,
    pub mime_type: Option<String>,
}

impl FetchFailure {
    pub fn new(error: FetchError) -> Self {
        Self {
            error,
            size_finalized: false,
            expected_size: None,
            mime_type: None,
        }
    }

    pub(crate) fn with_size(mut self, size: u64, finalized: bool) -> Self {
        self.expected_size = Some(size);
        self.size_finalized = finalized;
        self
    }

    pub(crate) fn with_mime(mut self, mime: Option<String>) -> Self {
        if self.mime_type.is_none() {
            self.mime_type = mime;
        }
        self
    }

    pub fn is_restartable(&self) -> bool {
        self.error.is_restartable()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, FetchError::Cancelled)
    }
}

impl From<FetchError> for FetchFailure {
    fn from(error: FetchError) -> Self {
        Self::new(error)
    }
}

impl From<BucketError> for FetchFailure {
    fn from(error: BucketError) -> Self {
        Self::new(error.into())
    }
}

/// Errors from an [`crate::ArchiveProvider`].
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The archive changed underneath us; refetching may help.
    #[error("archive restart: {0}")]
    Restart(String),

    #[error("archive failure: {0}")]
    Failure(String),

    #[error("not in archive: {0}")]
    NotInArchive(String),
}

impl From<ArchiveError> for FetchError {
    fn from(error: ArchiveError) -> Self {
        match error {
            ArchiveError::Restart(message) => FetchError::ArchiveFailure {
                restartable: true,
                message,
            },
            ArchiveError::Failure(message) => FetchError::ArchiveFailure {
                restartable: false,
                message,
            },
            ArchiveError::NotInArchive(name) => FetchError::NotInArchive(name),
        }
    }
}

impl From<ArchiveError> for FetchFailure {
    fn from(error: ArchiveError) -> Self {
        Self::new(error.into())
    }
}

/// Errors from a [`crate::Codec`].
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("output exceeds {limit} bytes")]
    SizeExceeded { limit: u64 },

    #[error("no codec registered for {0:?}")]
    Unsupported(CompressionCodec),

    #[error("codec I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CodecError> for FetchError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::SizeExceeded { limit } => FetchError::TooBig {
                size: Some(limit),
                metadata: false,
            },
            CodecError::Unsupported(codec) => {
                FetchError::UnknownMetadata(format!("unsupported compression {}", codec.as_str()))
            }
            CodecError::Io(e) => FetchError::Bucket(BucketError::Io(e)),
        }
    }
}

impl From<CodecError> for FetchFailure {
    fn from(error: CodecError) -> Self {
        Self::new(error.into())
    }
}

/// Result type for resolver operations.
pub type ResolveResult<T> = std::result::Result<T, FetchFailure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restartable_classification() {
        assert!(FetchError::BlockFetch(BlockFailure::DataNotFound).is_restartable());
        assert!(!FetchError::BlockFetch(BlockFailure::Verification("x".into())).is_restartable());
        assert!(FetchError::from(ArchiveError::Restart("changed".into())).is_restartable());
        assert!(!FetchError::from(ArchiveError::Failure("corrupt".into())).is_restartable());
        assert!(!FetchError::TooMuchRecursion { level: 3, max: 2 }.is_restartable());
    }

    #[test]
    fn test_codec_size_maps_to_too_big() {
        let err = FetchError::from(CodecError::SizeExceeded { limit: 10 });
        assert!(matches!(
            err,
            FetchError::TooBig {
                size: Some(10),
                metadata: false
            }
        ));
    }
}
