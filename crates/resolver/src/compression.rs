//! Payload codecs.
//!
//! The resolver only needs `decompress` with an output ceiling; `compress`
//! is used by insert tooling.

use crate::error::CodecError;
use async_compression::tokio::bufread::{GzipDecoder, XzDecoder, ZstdDecoder};
use async_compression::tokio::write::{GzipEncoder, XzEncoder, ZstdEncoder};
use async_trait::async_trait;
use bytes::Bytes;
use cask_core::CompressionCodec;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

/// A compression codec.
#[async_trait]
pub trait Codec: Send + Sync {
    fn kind(&self) -> CompressionCodec;

    async fn compress(&self, data: &[u8]) -> Result<Bytes, CodecError>;

    /// Decompress `data`, failing once the output would exceed `max_len`.
    async fn decompress(&self, data: &[u8], max_len: u64) -> Result<Bytes, CodecError>;
}

/// Codec backed by `async-compression`.
#[derive(Clone, Copy, Debug)]
pub struct StreamCodec {
    kind: CompressionCodec,
}

impl StreamCodec {
    pub fn new(kind: CompressionCodec) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Codec for StreamCodec {
    fn kind(&self) -> CompressionCodec {
        self.kind
    }

    async fn compress(&self, data: &[u8]) -> Result<Bytes, CodecError> {
        let mut output = Vec::new();
        match self.kind {
            CompressionCodec::Zstd => {
                let mut encoder =
                    ZstdEncoder::with_quality(&mut output, async_compression::Level::Default);
                encoder.write_all(data).await?;
                encoder.shutdown().await?;
            }
            CompressionCodec::Xz => {
                let mut encoder =
                    XzEncoder::with_quality(&mut output, async_compression::Level::Default);
                encoder.write_all(data).await?;
                encoder.shutdown().await?;
            }
            CompressionCodec::Gzip => {
                let mut encoder =
                    GzipEncoder::with_quality(&mut output, async_compression::Level::Default);
                encoder.write_all(data).await?;
                encoder.shutdown().await?;
            }
        }
        Ok(Bytes::from(output))
    }

    async fn decompress(&self, data: &[u8], max_len: u64) -> Result<Bytes, CodecError> {
        match self.kind {
            CompressionCodec::Zstd => read_limited(ZstdDecoder::new(data), max_len).await,
            CompressionCodec::Xz => read_limited(XzDecoder::new(data), max_len).await,
            CompressionCodec::Gzip => read_limited(GzipDecoder::new(data), max_len).await,
        }
    }
}

/// Read at most `max_len` bytes, failing if there is more.
async fn read_limited<R>(reader: R, max_len: u64) -> Result<Bytes, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut output = Vec::new();
    reader
        .take(max_len.saturating_add(1))
        .read_to_end(&mut output)
        .await?;
    if output.len() as u64 > max_len {
        return Err(CodecError::SizeExceeded { limit: max_len });
    }
    Ok(Bytes::from(output))
}

/// Codecs by kind.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<CompressionCodec, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Registry with no codecs.
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Register (or replace) a codec for its kind.
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.kind(), codec);
    }

    pub fn get(&self, kind: CompressionCodec) -> Result<Arc<dyn Codec>, CodecError> {
        self.codecs
            .get(&kind)
            .cloned()
            .ok_or(CodecError::Unsupported(kind))
    }
}

impl Default for CodecRegistry {
    /// zstd, xz and gzip.
    fn default() -> Self {
        let mut registry = Self::empty();
        for kind in [
            CompressionCodec::Zstd,
            CompressionCodec::Xz,
            CompressionCodec::Gzip,
        ] {
            registry.register(Arc::new(StreamCodec::new(kind)));
        }
        registry
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.codecs.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("CodecRegistry").field("codecs", &kinds).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_each_codec_restores_input() {
        let input = b"cask cask cask cask cask cask cask cask".repeat(32);
        let registry = CodecRegistry::default();
        for kind in [
            CompressionCodec::Zstd,
            CompressionCodec::Xz,
            CompressionCodec::Gzip,
        ] {
            let codec = registry.get(kind).unwrap();
            let packed = codec.compress(&input).await.unwrap();
            assert!(packed.len() < input.len(), "{kind:?} did not shrink input");
            let unpacked = codec.decompress(&packed, input.len() as u64).await.unwrap();
            assert_eq!(&unpacked[..], &input[..]);
        }
    }

    #[tokio::test]
    async fn test_decompress_enforces_ceiling() {
        let codec = StreamCodec::new(CompressionCodec::Zstd);
        let packed = codec.compress(&[0u8; 4096]).await.unwrap();
        let err = codec.decompress(&packed, 4095).await.unwrap_err();
        assert!(matches!(err, CodecError::SizeExceeded { limit: 4095 }));
    }

    #[test]
    fn test_empty_registry_reports_unsupported() {
        let registry = CodecRegistry::empty();
        assert!(matches!(
            registry.get(CompressionCodec::Xz),
            Err(CodecError::Unsupported(CompressionCodec::Xz))
        ));
    }
}
