//! Temporary buckets.
//!
//! A bucket holds one byte sequence, either in memory or in a temp file.
//! Memory buckets can move to disk at any time; open readers keep their
//! offset and continue against the new backing.

use crate::allocator::AllocatorShared;
use crate::error::{BucketError, BucketResult};
use crate::metrics::{BUCKET_MIGRATIONS, BUCKET_RAM_BYTES};
use bytes::Bytes;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// A byte buffer with one writer and any number of readers.
pub trait Bucket: Send + Sync {
    /// Bytes written so far.
    fn size(&self) -> u64;

    /// Open the writer. A second writer may only be opened after the first
    /// is dropped; it truncates the bucket and closes existing readers.
    fn writer(&self) -> BucketResult<Box<dyn Write + Send>>;

    /// Open a reader at offset zero. Requires that a writer has been opened.
    fn reader(&self) -> BucketResult<Box<dyn Read + Send>>;

    /// Release the backing storage. Further reads and writes fail.
    fn free(&self);

    fn is_freed(&self) -> bool;

    /// Read the whole bucket into memory.
    fn read_all(&self) -> BucketResult<Bytes> {
        let mut out = Vec::with_capacity(self.size() as usize);
        self.reader()?.read_to_end(&mut out)?;
        Ok(Bytes::from(out))
    }
}

/// Why a memory bucket moved to disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationReason {
    /// Grew past the per-bucket threshold.
    Size,
    /// A write would have pushed total memory use over the ceiling.
    Budget,
    /// Lived in memory longer than the maximum age.
    Age,
}

impl MigrationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Budget => "budget",
            Self::Age => "age",
        }
    }
}

pub(crate) enum Backing {
    Memory(Vec<u8>),
    File { file: File, path: PathBuf },
}

pub(crate) struct BucketState {
    pub(crate) backing: Backing,
    size: u64,
    writer_open: bool,
    /// Bumped each time a writer is opened; readers from older generations
    /// are closed.
    generation: u64,
    written: bool,
    freed: bool,
}

pub(crate) struct BucketShared {
    pub(crate) id: u64,
    pub(crate) created: Instant,
    state: Mutex<BucketState>,
    allocator: Arc<AllocatorShared>,
}

impl BucketShared {
    pub(crate) fn new(id: u64, backing: Backing, allocator: Arc<AllocatorShared>) -> Self {
        Self {
            id,
            created: Instant::now(),
            state: Mutex::new(BucketState {
                backing,
                size: 0,
                writer_open: false,
                generation: 0,
                written: false,
                freed: false,
            }),
            allocator,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn is_memory(&self) -> bool {
        let state = self.lock();
        !state.freed && matches!(state.backing, Backing::Memory(_))
    }

    /// Move a memory bucket to disk. No-op for file or freed buckets.
    pub(crate) fn migrate(&self, reason: MigrationReason) -> BucketResult<bool> {
        let mut state = self.lock();
        self.migrate_locked(&mut state, reason)
    }

    fn migrate_locked(
        &self,
        state: &mut BucketState,
        reason: MigrationReason,
    ) -> BucketResult<bool> {
        if state.freed {
            return Ok(false);
        }
        let Backing::Memory(data) = &state.backing else {
            return Ok(false);
        };

        let (mut file, path) = self.allocator.create_temp_file()?;
        if let Err(e) = file.write_all(data).and_then(|()| file.flush()) {
            let _ = std::fs::remove_file(&path);
            return Err(e.into());
        }

        let released = data.len() as u64;
        state.backing = Backing::File { file, path };
        self.allocator.release_ram(released);
        BUCKET_MIGRATIONS.with_label_values(&[reason.as_str()]).inc();
        tracing::debug!(
            bucket = self.id,
            bytes = released,
            reason = reason.as_str(),
            "migrated bucket to disk"
        );
        Ok(true)
    }

    fn open_writer(&self) -> BucketResult<u64> {
        let mut state = self.lock();
        if state.freed {
            return Err(BucketError::Freed(self.id));
        }
        if state.writer_open {
            return Err(BucketError::WriterOpen(self.id));
        }
        if state.written {
            self.truncate_locked(&mut state)?;
        }
        state.writer_open = true;
        state.written = true;
        state.generation += 1;
        Ok(state.generation)
    }

    fn truncate_locked(&self, state: &mut BucketState) -> BucketResult<()> {
        match &mut state.backing {
            Backing::Memory(data) => {
                self.allocator.release_ram(data.len() as u64);
                data.clear();
            }
            Backing::File { file, .. } => file.set_len(0)?,
        }
        state.size = 0;
        Ok(())
    }

    fn write(&self, generation: u64, buf: &[u8]) -> BucketResult<()> {
        let mut state = self.lock();
        if state.freed {
            return Err(BucketError::Freed(self.id));
        }
        if state.generation != generation {
            return Err(BucketError::StaleReader(self.id));
        }

        let delta = buf.len() as u64;
        let future_size = state.size + delta;
        if matches!(state.backing, Backing::Memory(_)) {
            // A memory write holds its reservation before touching the data.
            let reason = if future_size > self.allocator.config().migration_threshold() {
                Some(MigrationReason::Size)
            } else if !self.allocator.try_reserve_ram(delta) {
                Some(MigrationReason::Budget)
            } else {
                None
            };
            if let Some(reason) = reason {
                self.migrate_locked(&mut state, reason)?;
            }
        }

        match &mut state.backing {
            Backing::Memory(data) => data.extend_from_slice(buf),
            Backing::File { file, .. } => {
                file.seek(SeekFrom::End(0))?;
                file.write_all(buf)?;
            }
        }
        state.size = future_size;
        Ok(())
    }

    fn flush(&self) -> BucketResult<()> {
        let mut state = self.lock();
        if let Backing::File { file, .. } = &mut state.backing {
            file.flush()?;
        }
        Ok(())
    }

    fn close_writer(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation == generation {
            state.writer_open = false;
        }
    }

    fn read_at(&self, generation: u64, position: u64, buf: &mut [u8]) -> BucketResult<usize> {
        let mut state = self.lock();
        if state.freed {
            return Err(BucketError::Freed(self.id));
        }
        if state.generation != generation {
            return Err(BucketError::StaleReader(self.id));
        }
        if position >= state.size {
            return Ok(0);
        }

        let available = (state.size - position).min(buf.len() as u64) as usize;
        match &mut state.backing {
            Backing::Memory(data) => {
                let start = position as usize;
                buf[..available].copy_from_slice(&data[start..start + available]);
                Ok(available)
            }
            Backing::File { file, .. } => {
                file.seek(SeekFrom::Start(position))?;
                Ok(file.read(&mut buf[..available])?)
            }
        }
    }

    pub(crate) fn free(&self) {
        let mut state = self.lock();
        if state.freed {
            return;
        }
        state.freed = true;
        match std::mem::replace(&mut state.backing, Backing::Memory(Vec::new())) {
            Backing::Memory(data) => self.allocator.release_ram(data.len() as u64),
            Backing::File { file, path } => {
                drop(file);
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(bucket = self.id, path = %path.display(), error = %e, "failed to remove bucket file");
                }
            }
        }
        state.size = 0;
        BUCKET_RAM_BYTES.set(self.allocator.ram_in_use() as i64);
    }
}

/// Owning handle to a temporary bucket. Frees the bucket on drop.
pub struct TempBucket {
    shared: Arc<BucketShared>,
}

impl TempBucket {
    pub(crate) fn new(shared: Arc<BucketShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Whether the bytes currently live in memory.
    pub fn is_in_memory(&self) -> bool {
        self.shared.is_memory()
    }

    /// Move the bucket to disk now. Returns whether it moved.
    pub fn migrate_to_disk(&self) -> BucketResult<bool> {
        self.shared.migrate(MigrationReason::Size)
    }

    /// Open the writer with a concrete type.
    pub fn open_writer(&self) -> BucketResult<BucketWriter> {
        let generation = self.shared.open_writer()?;
        Ok(BucketWriter {
            shared: self.shared.clone(),
            generation,
        })
    }

    /// Open a reader with a concrete type.
    pub fn open_reader(&self) -> BucketResult<BucketReader> {
        let state = self.shared.lock();
        if state.freed {
            return Err(BucketError::Freed(self.shared.id));
        }
        if !state.written {
            return Err(BucketError::NotWritten(self.shared.id));
        }
        Ok(BucketReader {
            shared: self.shared.clone(),
            generation: state.generation,
            position: 0,
        })
    }

    /// Replace the contents with `data` on the blocking pool.
    pub async fn fill(&self, data: Bytes) -> BucketResult<()> {
        let mut writer = self.open_writer()?;
        tokio::task::spawn_blocking(move || -> BucketResult<()> {
            writer.write_all(&data)?;
            writer.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| BucketError::Task(e.to_string()))?
    }

    /// Read the contents on the blocking pool.
    pub async fn read_to_bytes(&self) -> BucketResult<Bytes> {
        let mut reader = self.open_reader()?;
        let size = self.size() as usize;
        tokio::task::spawn_blocking(move || -> BucketResult<Bytes> {
            let mut out = Vec::with_capacity(size);
            reader.read_to_end(&mut out)?;
            Ok(Bytes::from(out))
        })
        .await
        .map_err(|e| BucketError::Task(e.to_string()))?
    }
}

impl std::fmt::Debug for TempBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempBucket")
            .field("id", &self.shared.id)
            .field("size", &self.size())
            .field("in_memory", &self.is_in_memory())
            .finish()
    }
}

impl Bucket for TempBucket {
    fn size(&self) -> u64 {
        self.shared.lock().size
    }

    fn writer(&self) -> BucketResult<Box<dyn Write + Send>> {
        Ok(Box::new(self.open_writer()?))
    }

    fn reader(&self) -> BucketResult<Box<dyn Read + Send>> {
        Ok(Box::new(self.open_reader()?))
    }

    fn free(&self) {
        self.shared.free();
    }

    fn is_freed(&self) -> bool {
        self.shared.lock().freed
    }
}

impl Drop for TempBucket {
    fn drop(&mut self) {
        self.shared.free();
    }
}

/// Write half of a bucket.
pub struct BucketWriter {
    shared: Arc<BucketShared>,
    generation: u64,
}

impl Write for BucketWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.shared.write(self.generation, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(self.shared.flush()?)
    }
}

impl Drop for BucketWriter {
    fn drop(&mut self) {
        self.shared.close_writer(self.generation);
    }
}

/// Read half of a bucket. Keeps its offset across migrations.
pub struct BucketReader {
    shared: Arc<BucketShared>,
    generation: u64,
    position: u64,
}

impl BucketReader {
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Read for BucketReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.shared.read_at(self.generation, self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TieredBufferAllocator;
    use cask_core::config::BucketConfig;
    use tempfile::TempDir;

    fn allocator(temp: &TempDir) -> TieredBufferAllocator {
        TieredBufferAllocator::new(BucketConfig::for_testing(temp.path())).unwrap()
    }

    #[test]
    fn test_reader_requires_writer() {
        let temp = TempDir::new().unwrap();
        let bucket = allocator(&temp).allocate(16).unwrap();
        assert!(matches!(
            bucket.open_reader(),
            Err(BucketError::NotWritten(_))
        ));
    }

    #[test]
    fn test_single_writer() {
        let temp = TempDir::new().unwrap();
        let bucket = allocator(&temp).allocate(16).unwrap();
        let _writer = bucket.open_writer().unwrap();
        assert!(matches!(
            bucket.open_writer(),
            Err(BucketError::WriterOpen(_))
        ));
    }

    #[test]
    fn test_rewrite_closes_old_readers() {
        let temp = TempDir::new().unwrap();
        let bucket = allocator(&temp).allocate(16).unwrap();
        bucket.open_writer().unwrap().write_all(b"first").unwrap();
        let mut old = bucket.open_reader().unwrap();

        bucket.open_writer().unwrap().write_all(b"second!").unwrap();
        let mut buf = [0u8; 8];
        assert!(old.read(&mut buf).is_err());
        assert_eq!(bucket.read_all().unwrap(), Bytes::from_static(b"second!"));
    }

    #[test]
    fn test_free_removes_file() {
        let temp = TempDir::new().unwrap();
        let bucket = allocator(&temp).allocate(0).unwrap();
        bucket.open_writer().unwrap().write_all(b"on disk").unwrap();
        assert!(!bucket.is_in_memory());
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);

        bucket.free();
        assert!(bucket.is_freed());
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
        assert!(matches!(bucket.open_reader(), Err(BucketError::Freed(_))));
    }

    #[test]
    fn test_drop_releases_memory() {
        let temp = TempDir::new().unwrap();
        let alloc = allocator(&temp);
        let bucket = alloc.allocate(100).unwrap();
        bucket.open_writer().unwrap().write_all(&[7u8; 100]).unwrap();
        assert_eq!(alloc.ram_in_use(), 100);
        drop(bucket);
        assert_eq!(alloc.ram_in_use(), 0);
    }
}
