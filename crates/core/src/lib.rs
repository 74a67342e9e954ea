//! Core domain types shared by every cask crate.
//!
//! This crate defines the data model the resolver and scheduler agree on:
//! - Content and signed-subspace keys, client URIs and key blocks
//! - Metadata nodes and client hints
//! - Fetch contexts and their named masks
//! - Priority classes and request identifiers
//! - Configuration for the whole stack

pub mod block;
pub mod config;
pub mod context;
pub mod error;
pub mod hash;
pub mod key;
pub mod metadata;
pub mod priority;
pub mod request;

pub use block::KeyBlock;
pub use context::{ContextMask, FetchContext, FetchContextBuilder};
pub use error::{Error, Result};
pub use hash::ContentHash;
pub use key::{ClientUri, ContentKey, Key, SubspaceKey};
pub use metadata::{
    ArchiveKind, ClientMetadata, CompressionCodec, Metadata, SplitfileInfo, SplitfileSegment,
};
pub use priority::PriorityClass;
pub use request::{GetOptions, RequestId};

/// Default ceiling on a fetch result: 100 MiB.
pub const DEFAULT_MAX_OUTPUT_LENGTH: u64 = 100 * 1024 * 1024;

/// Default ceiling on a single metadata blob: 1 MiB.
pub const DEFAULT_MAX_METADATA_SIZE: u64 = 1024 * 1024;

/// Payload size of one splitfile data block: 32 KiB.
pub const BLOCK_SIZE: usize = 32 * 1024;
