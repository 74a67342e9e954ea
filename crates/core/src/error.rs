//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid uri: {0}")]
    InvalidUri(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("metadata too large: {size} bytes (limit {limit})")]
    MetadataTooLarge { size: u64, limit: u64 },

    #[error("metadata parse error: {0}")]
    MetadataParse(String),

    #[error("invalid fetch context: {0}")]
    InvalidContext(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
