//! Temporary buffers for fetch output and intermediate data.
//!
//! [`TieredBufferAllocator`] hands out [`TempBucket`]s that start in memory
//! when they are small and the memory budget allows, and move to temp files
//! when they grow, when memory runs short, or when they get old.

pub mod allocator;
pub mod bucket;
pub mod error;
pub mod metrics;

pub use allocator::TieredBufferAllocator;
pub use bucket::{Bucket, BucketReader, BucketWriter, MigrationReason, TempBucket};
pub use error::{BucketError, BucketResult};
