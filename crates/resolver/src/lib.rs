//! Resolution of client URIs into content.
//!
//! [`MetadataResolver`] fetches the block behind a URI through the
//! request scheduler and follows manifests, redirects, archives and
//! splitfiles until it reaches the final bytes. Archive extraction and
//! compression sit behind the [`ArchiveProvider`] and [`Codec`] ports.

pub mod archive;
pub mod compression;
pub mod editions;
pub mod error;
pub mod events;
pub mod resolver;
mod slot;
pub mod state;

pub use archive::{ArchiveId, ArchiveProvider, INDEX_MEMBER, MemoryArchiveProvider, pack_archive};
pub use compression::{Codec, CodecRegistry, StreamCodec};
pub use editions::EditionTracker;
pub use error::{ArchiveError, CodecError, FetchError, FetchFailure, PathOrigin, ResolveResult};
pub use events::{FetchResult, ResolverEvent};
pub use resolver::{MetadataResolver, ResolutionHandle, ResolverServices, Verbosity};
pub use state::ResolutionState;
