//! Signing and verification of cask key blocks.
//!
//! This crate provides:
//! - Ed25519 key pairs owning a signed subspace
//! - Signing of subspace blocks
//! - Verification of both content and subspace blocks

pub mod error;
pub mod key;
pub mod signer;

pub use error::{SignerError, SignerResult};
pub use key::{KeyPair, PublicKey, SecretKey};
pub use signer::{SubspaceSigner, verify_block};
