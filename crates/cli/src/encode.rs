//! Turning local files into blocks and the metadata that describes them.

use anyhow::{Context, Result};
use bytes::Bytes;
use cask_core::{
    ClientMetadata, ClientUri, CompressionCodec, KeyBlock, Metadata, SplitfileInfo,
    SplitfileSegment,
};
use cask_resolver::CodecRegistry;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Data keys per splitfile segment.
pub const SEGMENT_BLOCKS: usize = 128;

/// Page served when a directory is fetched without a path.
const INDEX_PAGE: &str = "index.html";

/// Blocks produced for some content and the node that points at them.
#[derive(Debug)]
pub struct Encoded {
    pub metadata: Metadata,
    pub blocks: Vec<KeyBlock>,
}

#[derive(Clone)]
pub struct Encoder {
    codecs: Arc<CodecRegistry>,
    block_size: usize,
}

impl Encoder {
    pub fn new(codecs: Arc<CodecRegistry>) -> Self {
        Self {
            codecs,
            block_size: cask_core::BLOCK_SIZE,
        }
    }

    #[cfg(test)]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Compress `data` if asked, then store it as one block or as a
    /// splitfile of blocks.
    pub async fn encode_bytes(
        &self,
        data: Bytes,
        mime: Option<&str>,
        compression: Option<CompressionCodec>,
    ) -> Result<Encoded> {
        let original_len = data.len() as u64;
        let payload = match compression {
            Some(kind) => self
                .codecs
                .get(kind)?
                .compress(&data)
                .await
                .with_context(|| format!("failed to compress with {}", kind.as_str()))?,
            None => data,
        };
        let client = mime.map(ClientMetadata::with_mime).unwrap_or_default();

        if payload.len() <= self.block_size {
            let block = KeyBlock::content(payload, false);
            let metadata = Metadata::SingleRedirect {
                target: ClientUri::from(block.key().clone()),
                client,
                compression,
            };
            return Ok(Encoded {
                metadata,
                blocks: vec![block],
            });
        }

        let blocks: Vec<KeyBlock> = (0..payload.len())
            .step_by(self.block_size)
            .map(|start| {
                let end = (start + self.block_size).min(payload.len());
                KeyBlock::content(payload.slice(start..end), false)
            })
            .collect();
        let keys: Vec<_> = blocks.iter().map(|b| b.key().clone()).collect();
        let segments = keys
            .chunks(SEGMENT_BLOCKS)
            .map(|chunk| SplitfileSegment {
                data_keys: chunk.to_vec(),
                check_keys: Vec::new(),
            })
            .collect();
        tracing::debug!(
            size = payload.len(),
            blocks = blocks.len(),
            compressed = compression.is_some(),
            "encoded splitfile"
        );

        let info = SplitfileInfo {
            segments,
            data_length: payload.len() as u64,
            uncompressed_length: compression.map(|_| original_len),
            compression,
            client,
        };
        Ok(Encoded {
            metadata: Metadata::Splitfile(info),
            blocks,
        })
    }

    /// A simple manifest of everything under `dir`. Subdirectories become
    /// nested manifests and `index.html` doubles as the default entry.
    pub fn encode_dir<'a>(&'a self, dir: &'a Path) -> BoxFuture<'a, Result<Encoded>> {
        Box::pin(async move {
            let mut paths = Vec::new();
            let mut listing = tokio::fs::read_dir(dir)
                .await
                .with_context(|| format!("failed to read directory {}", dir.display()))?;
            while let Some(entry) = listing.next_entry().await? {
                paths.push(entry.path());
            }
            paths.sort();

            let mut entries = BTreeMap::new();
            let mut blocks = Vec::new();
            for path in paths {
                let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
                else {
                    tracing::warn!(path = %path.display(), "skipping entry with a non-UTF-8 name");
                    continue;
                };
                let kind = tokio::fs::metadata(&path)
                    .await
                    .with_context(|| format!("failed to stat {}", path.display()))?;
                let encoded = if kind.is_dir() {
                    self.encode_dir(&path).await?
                } else if kind.is_file() {
                    let data = tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    self.encode_bytes(Bytes::from(data), guess_mime(&path), None)
                        .await?
                } else {
                    tracing::warn!(path = %path.display(), "skipping special file");
                    continue;
                };
                blocks.extend(encoded.blocks);
                entries.insert(name, encoded.metadata);
            }

            if let Some(index) = entries.get(INDEX_PAGE).cloned() {
                entries.insert(String::new(), index);
            }
            tracing::debug!(dir = %dir.display(), entries = entries.len(), "encoded directory");
            Ok(Encoded {
                metadata: Metadata::SimpleManifest { entries },
                blocks,
            })
        })
    }

    /// Every block to insert plus the URI that resolves to the content.
    ///
    /// Plain data is addressed directly. Anything else gets a metadata
    /// block; metadata too large for one block is itself stored as data
    /// behind a multi-level redirect.
    pub async fn publish(&self, encoded: Encoded) -> Result<(ClientUri, Vec<KeyBlock>)> {
        let Encoded {
            metadata,
            mut blocks,
        } = encoded;
        if let Metadata::SingleRedirect {
            target,
            client,
            compression: None,
        } = &metadata
            && client.is_empty()
        {
            return Ok((target.clone(), blocks));
        }

        let mut bytes = metadata.to_bytes()?;
        while bytes.len() > self.block_size {
            let blob = self.encode_bytes(Bytes::from(bytes.clone()), None, None).await?;
            let wrapped = Metadata::MultiLevelRedirect {
                source: Box::new(blob.metadata),
            }
            .to_bytes()?;
            if wrapped.len() >= bytes.len() {
                break;
            }
            tracing::debug!(from = bytes.len(), to = wrapped.len(), "wrapped large metadata");
            blocks.extend(blob.blocks);
            bytes = wrapped;
        }

        let block = KeyBlock::content(bytes, true);
        let uri = ClientUri::from(block.key().clone());
        blocks.push(block);
        Ok((uri, blocks))
    }
}

/// MIME type for common file extensions.
pub fn guess_mime(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "html" | "htm" => "text/html",
        "txt" | "md" => "text/plain",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        _ => return None,
    };
    Some(mime)
}
