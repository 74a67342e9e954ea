//! Tiered buffer allocation.
//!
//! Small buckets start in memory while the global memory budget allows it;
//! everything else goes straight to a temp file. Memory buckets that grow
//! too large, that would break the budget, or that live too long are moved
//! to disk.

use crate::bucket::{Backing, BucketShared, MigrationReason, TempBucket};
use crate::error::BucketResult;
use crate::metrics::{BUCKET_RAM_BYTES, BUCKETS_ALLOCATED};
use cask_core::config::BucketConfig;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

pub(crate) struct AllocatorShared {
    config: BucketConfig,
    temp_dir: PathBuf,
    ram_in_use: AtomicU64,
    next_id: AtomicU64,
    /// Memory buckets in creation order.
    ram_buckets: Mutex<VecDeque<Weak<BucketShared>>>,
}

impl AllocatorShared {
    pub(crate) fn config(&self) -> &BucketConfig {
        &self.config
    }

    pub(crate) fn ram_in_use(&self) -> u64 {
        self.ram_in_use.load(Ordering::SeqCst)
    }

    /// Reserve `bytes` of memory if the total stays within the ceiling.
    pub(crate) fn try_reserve_ram(&self, bytes: u64) -> bool {
        let limit = self.config.max_ram_total;
        match self
            .ram_in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                v.checked_add(bytes).filter(|&total| total <= limit)
            }) {
            Ok(previous) => {
                BUCKET_RAM_BYTES.set((previous + bytes) as i64);
                true
            }
            Err(_) => false,
        }
    }

    /// Whether `bytes` more would currently fit under the ceiling.
    fn has_room_for(&self, bytes: u64) -> bool {
        self.ram_in_use()
            .checked_add(bytes)
            .is_some_and(|total| total <= self.config.max_ram_total)
    }

    pub(crate) fn release_ram(&self, bytes: u64) {
        let previous = self
            .ram_in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(bytes))
            })
            .unwrap_or(0);
        BUCKET_RAM_BYTES.set(previous.saturating_sub(bytes) as i64);
    }

    pub(crate) fn create_temp_file(&self) -> std::io::Result<(File, PathBuf)> {
        let path = self.temp_dir.join(format!("cask-{}.tmp", Uuid::new_v4()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok((file, path))
    }
}

/// Allocates temporary buckets and moves them between memory and disk.
#[derive(Clone)]
pub struct TieredBufferAllocator {
    shared: Arc<AllocatorShared>,
}

impl TieredBufferAllocator {
    /// Create an allocator, creating the temp directory if needed.
    pub fn new(config: BucketConfig) -> BucketResult<Self> {
        let temp_dir = config
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&temp_dir)?;
        Ok(Self {
            shared: Arc::new(AllocatorShared {
                config,
                temp_dir,
                ram_in_use: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                ram_buckets: Mutex::new(VecDeque::new()),
            }),
        })
    }

    pub fn config(&self) -> &BucketConfig {
        &self.shared.config
    }

    /// Bytes currently held by memory buckets.
    pub fn ram_in_use(&self) -> u64 {
        self.shared.ram_in_use()
    }

    /// Allocate a bucket for roughly `size_hint` bytes.
    ///
    /// The bucket starts in memory iff the hint is non-zero, at most the
    /// per-bucket memory limit, and the hint fits under the memory ceiling.
    /// Memory is reserved per write, so the ceiling holds even when many
    /// buckets start in memory at once.
    pub fn allocate(&self, size_hint: u64) -> BucketResult<TempBucket> {
        let config = &self.shared.config;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let in_memory = size_hint > 0
            && size_hint <= config.max_ram_bucket_size
            && self.shared.has_room_for(size_hint);

        let backing = if in_memory {
            Backing::Memory(Vec::with_capacity(size_hint as usize))
        } else {
            let (file, path) = self.shared.create_temp_file()?;
            Backing::File { file, path }
        };

        let bucket = Arc::new(BucketShared::new(id, backing, self.shared.clone()));
        if in_memory {
            self.lock_queue().push_back(Arc::downgrade(&bucket));
            BUCKETS_ALLOCATED.with_label_values(&["memory"]).inc();
            self.schedule_sweep();
        } else {
            BUCKETS_ALLOCATED.with_label_values(&["file"]).inc();
        }
        tracing::trace!(bucket = id, size_hint, in_memory, "allocated bucket");
        Ok(TempBucket::new(bucket))
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Weak<BucketShared>>> {
        self.shared
            .ram_buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sweep aged buckets on the blocking pool when a runtime is available
    /// and the oldest memory bucket is already past the maximum age.
    fn schedule_sweep(&self) {
        let max_age = self.shared.config.max_age();
        let oldest_expired = self
            .lock_queue()
            .front()
            .and_then(Weak::upgrade)
            .is_some_and(|b| b.created.elapsed() >= max_age);
        if !oldest_expired {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let allocator = self.clone();
            handle.spawn_blocking(move || allocator.sweep());
        }
    }

    /// Move memory buckets older than the configured maximum age to disk.
    pub fn sweep(&self) -> usize {
        self.sweep_older_than(self.shared.config.max_age())
    }

    /// Move memory buckets older than `max_age` to disk. Returns how many
    /// moved.
    pub fn sweep_older_than(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut queue = self.lock_queue();
            while let Some(front) = queue.front() {
                match front.upgrade() {
                    None => {
                        queue.pop_front();
                    }
                    Some(bucket) if now.duration_since(bucket.created) >= max_age => {
                        queue.pop_front();
                        expired.push(bucket);
                    }
                    Some(_) => break,
                }
            }
        }

        let mut moved = 0;
        for bucket in expired {
            match bucket.migrate(MigrationReason::Age) {
                Ok(true) => moved += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(bucket = bucket.id, error = %e, "failed to migrate aged bucket");
                }
            }
        }
        if moved > 0 {
            tracing::debug!(moved, "swept aged buckets to disk");
        }
        moved
    }

    /// Run the age sweep on a fixed interval until the handle is aborted.
    pub fn spawn_sweep_task(&self) -> JoinHandle<()> {
        let allocator = self.clone();
        let period = self.shared.config.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let allocator = allocator.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || allocator.sweep()).await {
                    tracing::error!(error = %e, "bucket sweep panicked");
                }
            }
        })
    }

    /// Allocate a bucket sized for `data` and fill it.
    pub async fn store_bytes(&self, data: bytes::Bytes) -> BucketResult<TempBucket> {
        let bucket = self.allocate(data.len() as u64)?;
        bucket.fill(data).await?;
        Ok(bucket)
    }
}

impl std::fmt::Debug for TieredBufferAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredBufferAllocator")
            .field("temp_dir", &self.shared.temp_dir)
            .field("ram_in_use", &self.ram_in_use())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::Bucket;
    use std::io::Write;
    use tempfile::TempDir;

    fn allocator(temp: &TempDir) -> TieredBufferAllocator {
        TieredBufferAllocator::new(BucketConfig::for_testing(temp.path())).unwrap()
    }

    #[test]
    fn test_small_hint_starts_in_memory() {
        let temp = TempDir::new().unwrap();
        let alloc = allocator(&temp);
        assert!(alloc.allocate(512).unwrap().is_in_memory());
        assert!(alloc.allocate(1024).unwrap().is_in_memory());
    }

    #[test]
    fn test_zero_or_large_hint_goes_to_disk() {
        let temp = TempDir::new().unwrap();
        let alloc = allocator(&temp);
        assert!(!alloc.allocate(0).unwrap().is_in_memory());
        assert!(!alloc.allocate(1025).unwrap().is_in_memory());
    }

    #[test]
    fn test_exhausted_budget_goes_to_disk() {
        let temp = TempDir::new().unwrap();
        let mut config = BucketConfig::for_testing(temp.path());
        config.max_ram_total = 1500;
        let alloc = TieredBufferAllocator::new(config).unwrap();

        let a = alloc.allocate(1000).unwrap();
        a.open_writer().unwrap().write_all(&[1u8; 1000]).unwrap();
        let b = alloc.allocate(400).unwrap();
        assert!(b.is_in_memory());
        b.open_writer().unwrap().write_all(&[2u8; 1000]).unwrap();

        // The second write would have crossed the ceiling.
        assert!(!b.is_in_memory());
        assert_eq!(alloc.ram_in_use(), 1000);
        assert_eq!(b.read_all().unwrap().len(), 1000);
    }

    #[test]
    fn test_hint_over_remaining_budget_starts_on_disk() {
        let temp = TempDir::new().unwrap();
        let mut config = BucketConfig::for_testing(temp.path());
        config.max_ram_total = 1500;
        let alloc = TieredBufferAllocator::new(config).unwrap();

        let a = alloc.allocate(1000).unwrap();
        a.open_writer().unwrap().write_all(&[1u8; 1000]).unwrap();

        assert!(!alloc.allocate(1000).unwrap().is_in_memory());
        assert!(alloc.allocate(500).unwrap().is_in_memory());
    }

    #[test]
    fn test_sweep_moves_old_buckets() {
        let temp = TempDir::new().unwrap();
        let alloc = allocator(&temp);
        let bucket = alloc.allocate(10).unwrap();
        bucket.open_writer().unwrap().write_all(b"aged bytes").unwrap();

        assert_eq!(alloc.sweep(), 0);
        assert_eq!(alloc.sweep_older_than(Duration::ZERO), 1);
        assert!(!bucket.is_in_memory());
        assert_eq!(alloc.ram_in_use(), 0);
        assert_eq!(&bucket.read_all().unwrap()[..], b"aged bytes");

        // Already swept buckets leave the queue.
        assert_eq!(alloc.sweep_older_than(Duration::ZERO), 0);
    }

    #[test]
    fn test_sweep_skips_dropped_buckets() {
        let temp = TempDir::new().unwrap();
        let alloc = allocator(&temp);
        drop(alloc.allocate(10).unwrap());
        assert_eq!(alloc.sweep_older_than(Duration::ZERO), 0);
    }

    #[tokio::test]
    async fn test_store_bytes() {
        let temp = TempDir::new().unwrap();
        let alloc = allocator(&temp);
        let bucket = alloc
            .store_bytes(bytes::Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert_eq!(&bucket.read_to_bytes().await.unwrap()[..], b"payload");
    }
}
