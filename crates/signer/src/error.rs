//! Signer error types.

use thiserror::Error;

/// Signing and verification errors.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("key parsing error: {0}")]
    KeyParsing(String),

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("invalid signature format: {0}")]
    InvalidSignature(String),

    #[error(transparent)]
    Core(#[from] cask_core::Error),
}

/// Result type for signing operations.
pub type SignerResult<T> = std::result::Result<T, SignerError>;
