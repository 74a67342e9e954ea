//! Local filesystem block store.
//!
//! Blocks are stored as JSON under `blocks/ab/cd/<routing hash>.json`,
//! sharded by the first two bytes of the routing hash.

use crate::error::{StorageError, StorageResult};
use crate::traits::{KeyStore, KeyStream, StoreFetchOptions};
use async_trait::async_trait;
use cask_core::{Key, KeyBlock};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

const BLOCKS_DIR: &str = "blocks";

/// Block store rooted at a local directory.
pub struct FilesystemKeyStore {
    root: PathBuf,
}

impl FilesystemKeyStore {
    /// Open (creating if needed) a store under `root`.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(BLOCKS_DIR)).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative object name for a key.
    fn object_name(key: &Key) -> String {
        let hash = key.routing_hash();
        format!("{BLOCKS_DIR}/{}/{}.json", hash.shard_prefix(), hash.to_hex())
    }

    /// Full path for a key, refusing anything that resolves outside the root.
    async fn key_path(&self, key: &Key) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let name = Self::object_name(key);
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &name))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    fn key_path_sync(root: &Path, name: &str) -> StorageResult<PathBuf> {
        for component in Path::new(name).components() {
            if !matches!(component, std::path::Component::Normal(_)) {
                return Err(StorageError::InvalidPath(format!(
                    "unsafe path component in {name}"
                )));
            }
        }

        let path = root.join(name);
        let root_canonical = root.canonicalize()?;

        // Existing entries (including symlinks) must resolve inside the root.
        let mut probe = path.as_path();
        loop {
            match std::fs::symlink_metadata(probe) {
                Ok(_) => {
                    let canonical = probe.canonicalize().map_err(|_| {
                        StorageError::InvalidPath(format!("dangling symlink at {}", probe.display()))
                    })?;
                    if !canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidPath(format!(
                            "{} escapes store root",
                            probe.display()
                        )));
                    }
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => match probe.parent() {
                    Some(parent) => probe = parent,
                    None => return Ok(path),
                },
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
    }

    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn decode(key: &Key, data: &[u8]) -> StorageResult<KeyBlock> {
        let block = KeyBlock::from_json(data).map_err(|e| StorageError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        if block.key() != key {
            return Err(StorageError::Corrupt {
                key: key.to_string(),
                reason: format!("file holds {}", block.key()),
            });
        }
        Ok(block)
    }
}

#[async_trait]
impl KeyStore for FilesystemKeyStore {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn probably_has(&self, key: &Key) -> bool {
        match self.key_path(key).await {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(e) => {
                tracing::warn!(error = %e, "store path check failed");
                false
            }
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn fetch(
        &self,
        key: &Key,
        options: StoreFetchOptions,
    ) -> StorageResult<Option<KeyBlock>> {
        let path = self.key_path(key).await?;
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Io(e)),
        };
        let block = Self::decode(key, &data)?;

        if !options.dont_promote {
            let touch = tokio::task::spawn_blocking(move || {
                std::fs::File::options()
                    .write(true)
                    .open(&path)
                    .and_then(|f| f.set_modified(SystemTime::now()))
            })
            .await;
            if let Ok(Err(e)) = touch {
                tracing::debug!(error = %e, "failed to promote block");
            }
        }

        Ok(Some(block))
    }

    #[instrument(skip(self, block), fields(backend = "filesystem", key = %block.key()))]
    async fn put(&self, block: KeyBlock) -> StorageResult<()> {
        let path = self.key_path(block.key()).await?;
        if fs::try_exists(&path).await? {
            return Ok(());
        }
        self.ensure_parent(&path).await?;
        let data = block.to_json()?;

        // Write to a uniquely named temp file, fsync, then rename.
        let temp_path = path.with_extension(format!("tmp.{}", Uuid::new_v4()));
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list_keys(&self) -> StorageResult<KeyStream> {
        let base = self.root.join(BLOCKS_DIR);

        let stream = async_stream::try_stream! {
            let mut stack = vec![base];
            while let Some(dir) = stack.pop() {
                let mut entries = fs::read_dir(&dir).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    // file_type() does not follow symlinks
                    let file_type = entry.file_type().await?;
                    if file_type.is_dir() {
                        stack.push(path);
                    } else if file_type.is_file()
                        && path.extension().is_some_and(|ext| ext == "json")
                    {
                        let data = fs::read(&path).await?;
                        let block = KeyBlock::from_json(&data)?;
                        yield block.key().clone();
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_fetch_sharded_layout() {
        let temp = TempDir::new().unwrap();
        let store = FilesystemKeyStore::new(temp.path()).await.unwrap();
        let block = KeyBlock::content(Bytes::from_static(b"hello"), false);

        store.put(block.clone()).await.unwrap();

        let hash = block.key().routing_hash();
        let expected = temp
            .path()
            .join("blocks")
            .join(hash.shard_prefix())
            .join(format!("{}.json", hash.to_hex()));
        assert!(expected.exists());

        let fetched = store
            .fetch(block.key(), StoreFetchOptions::default())
            .await
            .unwrap();
        assert_eq!(fetched, Some(block));
    }

    #[tokio::test]
    async fn test_missing_block_is_none() {
        let temp = TempDir::new().unwrap();
        let store = FilesystemKeyStore::new(temp.path()).await.unwrap();
        let block = KeyBlock::content(Bytes::from_static(b"absent"), false);

        assert!(!store.probably_has(block.key()).await);
        let fetched = store
            .fetch(block.key(), StoreFetchOptions::default())
            .await
            .unwrap();
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_reported() {
        let temp = TempDir::new().unwrap();
        let store = FilesystemKeyStore::new(temp.path()).await.unwrap();
        let block = KeyBlock::content(Bytes::from_static(b"x"), false);
        store.put(block.clone()).await.unwrap();

        let path = store.key_path(block.key()).await.unwrap();
        std::fs::write(&path, b"garbage").unwrap();

        let err = store
            .fetch(block.key(), StoreFetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_list_keys() {
        let temp = TempDir::new().unwrap();
        let store = FilesystemKeyStore::new(temp.path()).await.unwrap();
        let a = KeyBlock::content(Bytes::from_static(b"a"), false);
        let b = KeyBlock::content(Bytes::from_static(b"b"), true);
        store.put(a.clone()).await.unwrap();
        store.put(b.clone()).await.unwrap();

        let mut keys: Vec<Key> = store.list_keys().await.unwrap().try_collect().await.unwrap();
        keys.sort();
        let mut expected = vec![a.key().clone(), b.key().clone()];
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_shard_outside_root_rejected() {
        let temp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let store = FilesystemKeyStore::new(temp.path()).await.unwrap();
        let block = KeyBlock::content(Bytes::from_static(b"evil"), false);

        let hash = block.key().routing_hash();
        let hex = hash.to_hex();
        let first = temp.path().join("blocks").join(&hex[0..2]);
        std::os::unix::fs::symlink(outside.path(), &first).unwrap();

        assert!(store.put(block).await.is_err());
    }
}
