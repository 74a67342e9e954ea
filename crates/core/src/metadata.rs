//! Metadata describing how to obtain the payload behind a key.
//!
//! Metadata arrives from the network and is untrusted. It is parsed with a
//! size ceiling and every variant change goes through a consuming
//! conversion, so a node is never observed half-way between two variants.

use crate::key::{ClientUri, Key};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Compression applied to a payload before it was stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    Gzip,
    Zstd,
    Xz,
}

impl CompressionCodec {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionCodec::Gzip => "gzip",
            CompressionCodec::Zstd => "zstd",
            CompressionCodec::Xz => "xz",
        }
    }
}

impl std::str::FromStr for CompressionCodec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gzip" => Ok(CompressionCodec::Gzip),
            "zstd" => Ok(CompressionCodec::Zstd),
            "xz" => Ok(CompressionCodec::Xz),
            other => Err(Error::Serialization(format!("unknown codec: {other}"))),
        }
    }
}

/// Container formats the resolver can enter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    Zip,
    Tar,
    Cask,
}

impl ArchiveKind {
    /// Recognise an archive container from a MIME type (parameters ignored).
    pub fn from_mime(mime: &str) -> Option<Self> {
        match strip_mime_params(mime) {
            "application/zip" => Some(ArchiveKind::Zip),
            "application/x-tar" => Some(ArchiveKind::Tar),
            "application/x-cask-archive" => Some(ArchiveKind::Cask),
            _ => None,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ArchiveKind::Zip => "application/zip",
            ArchiveKind::Tar => "application/x-tar",
            ArchiveKind::Cask => "application/x-cask-archive",
        }
    }
}

fn strip_mime_params(mime: &str) -> &str {
    mime.split(';').next().unwrap_or(mime).trim()
}

/// Client-visible hints carried alongside redirects.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ClientMetadata {
    pub fn with_mime(mime: impl Into<String>) -> Self {
        Self {
            mime_type: Some(mime.into()),
        }
    }

    /// Fill unset fields from `other`. Fields already set are kept.
    pub fn merge_no_overwrite(&mut self, other: &ClientMetadata) {
        if self.mime_type.is_none() {
            self.mime_type.clone_from(&other.mime_type);
        }
    }

    /// MIME type without `; charset=...` style parameters.
    pub fn mime_type_no_params(&self) -> Option<&str> {
        self.mime_type.as_deref().map(strip_mime_params)
    }

    pub fn clear(&mut self) {
        self.mime_type = None;
    }

    pub fn is_empty(&self) -> bool {
        self.mime_type.is_none()
    }
}

/// One erasure-coded segment of a splitfile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitfileSegment {
    pub data_keys: Vec<Key>,
    #[serde(default)]
    pub check_keys: Vec<Key>,
}

/// Layout of a payload split across many blocks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitfileInfo {
    pub segments: Vec<SplitfileSegment>,
    /// Length of the (possibly compressed) stored data.
    pub data_length: u64,
    /// Length after decompression, when compressed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncompressed_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionCodec>,
    #[serde(default)]
    pub client: ClientMetadata,
}

impl SplitfileInfo {
    /// All data keys in layout order.
    pub fn data_keys(&self) -> impl Iterator<Item = &Key> {
        self.segments.iter().flat_map(|s| s.data_keys.iter())
    }

    pub fn data_block_count(&self) -> usize {
        self.segments.iter().map(|s| s.data_keys.len()).sum()
    }

    /// Largest size this splitfile may produce, compressed or not.
    pub fn max_length(&self) -> u64 {
        self.data_length.max(self.uncompressed_length.unwrap_or(0))
    }
}

/// A metadata node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Metadata {
    /// Maps path components to child nodes. `""` names the default entry.
    SimpleManifest { entries: BTreeMap<String, Metadata> },
    /// Manifest entry that points at another entry of the same manifest.
    SymbolicShortlink { target: String },
    /// A container whose index and members are fetched as one payload.
    ArchiveManifest {
        archive_kind: ArchiveKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compression: Option<CompressionCodec>,
        /// How to fetch the archive body.
        source: Box<Metadata>,
        #[serde(default)]
        client: ClientMetadata,
    },
    /// Final data stored as a member of the current archive.
    ArchiveInternalRedirect {
        name: String,
        #[serde(default)]
        client: ClientMetadata,
    },
    /// Further metadata stored as a member of the current archive.
    ArchiveMetadataRedirect { name: String },
    /// The payload behind `source` is itself a metadata blob.
    MultiLevelRedirect { source: Box<Metadata> },
    SingleRedirect {
        target: ClientUri,
        #[serde(default)]
        client: ClientMetadata,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compression: Option<CompressionCodec>,
    },
    Splitfile(SplitfileInfo),
}

impl Metadata {
    /// Parse an untrusted blob, rejecting anything over `max_size` bytes.
    pub fn parse(data: &[u8], max_size: u64) -> Result<Self> {
        let size = data.len() as u64;
        if size > max_size {
            return Err(Error::MetadataTooLarge {
                size,
                limit: max_size,
            });
        }
        serde_json::from_slice(data).map_err(|e| Error::MetadataParse(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn single_redirect(target: ClientUri, mime: Option<&str>) -> Self {
        Metadata::SingleRedirect {
            target,
            client: ClientMetadata {
                mime_type: mime.map(str::to_string),
            },
            compression: None,
        }
    }

    pub fn simple_manifest<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, Metadata)>,
        S: Into<String>,
    {
        Metadata::SimpleManifest {
            entries: entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Short variant name for logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Metadata::SimpleManifest { .. } => "simple_manifest",
            Metadata::SymbolicShortlink { .. } => "symbolic_shortlink",
            Metadata::ArchiveManifest { .. } => "archive_manifest",
            Metadata::ArchiveInternalRedirect { .. } => "archive_internal_redirect",
            Metadata::ArchiveMetadataRedirect { .. } => "archive_metadata_redirect",
            Metadata::MultiLevelRedirect { .. } => "multi_level_redirect",
            Metadata::SingleRedirect { .. } => "single_redirect",
            Metadata::Splitfile(_) => "splitfile",
        }
    }

    pub fn client_metadata(&self) -> Option<&ClientMetadata> {
        match self {
            Metadata::ArchiveManifest { client, .. }
            | Metadata::ArchiveInternalRedirect { client, .. }
            | Metadata::SingleRedirect { client, .. } => Some(client),
            Metadata::Splitfile(info) => Some(&info.client),
            _ => None,
        }
    }

    /// Reclassify a redirect to an archive container as an archive manifest.
    /// The redirect (with its client hints cleared) becomes the archive source.
    /// Other variants are returned unchanged.
    pub fn into_implicit_archive(self, kind: ArchiveKind) -> Self {
        match self {
            Metadata::SingleRedirect {
                target,
                compression,
                ..
            } => Metadata::ArchiveManifest {
                archive_kind: kind,
                compression: None,
                source: Box::new(Metadata::SingleRedirect {
                    target,
                    client: ClientMetadata::default(),
                    compression,
                }),
                client: ClientMetadata::default(),
            },
            Metadata::Splitfile(mut info) => {
                info.client.clear();
                Metadata::ArchiveManifest {
                    archive_kind: kind,
                    compression: None,
                    source: Box::new(Metadata::Splitfile(info)),
                    client: ClientMetadata::default(),
                }
            }
            other => other,
        }
    }

    /// Turn an archive manifest into the redirect that fetches its raw body.
    /// Other variants are returned unchanged.
    pub fn into_archive_source(self) -> Self {
        match self {
            Metadata::ArchiveManifest { source, .. } => *source,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ContentKey;

    fn target() -> ClientUri {
        ClientUri::from(Key::from(ContentKey::for_payload(false, b"t")))
    }

    #[test]
    fn test_parse_rejects_oversized_blob() {
        let blob = Metadata::single_redirect(target(), None).to_bytes().unwrap();
        let err = Metadata::parse(&blob, 4).unwrap_err();
        assert!(matches!(err, Error::MetadataTooLarge { limit: 4, .. }));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            Metadata::parse(b"not json", 1024),
            Err(Error::MetadataParse(_))
        ));
    }

    #[test]
    fn test_nested_manifest_parses() {
        let meta = Metadata::simple_manifest([
            ("", Metadata::single_redirect(target(), Some("text/html"))),
            (
                "alias",
                Metadata::SymbolicShortlink {
                    target: "".to_string(),
                },
            ),
        ]);
        let blob = meta.to_bytes().unwrap();
        assert_eq!(Metadata::parse(&blob, 1 << 20).unwrap(), meta);
    }

    #[test]
    fn test_merge_no_overwrite_keeps_first_writer() {
        let mut client = ClientMetadata::with_mime("text/plain");
        client.merge_no_overwrite(&ClientMetadata::with_mime("image/png"));
        assert_eq!(client.mime_type.as_deref(), Some("text/plain"));

        let mut empty = ClientMetadata::default();
        empty.merge_no_overwrite(&ClientMetadata::with_mime("image/png"));
        assert_eq!(empty.mime_type.as_deref(), Some("image/png"));
    }

    #[test]
    fn test_archive_mime_detection_ignores_params() {
        assert_eq!(
            ArchiveKind::from_mime("application/zip; charset=binary"),
            Some(ArchiveKind::Zip)
        );
        assert_eq!(ArchiveKind::from_mime("text/html"), None);
    }

    #[test]
    fn test_implicit_archive_clears_client_metadata() {
        let meta = Metadata::single_redirect(target(), Some("application/zip"));
        let archive = meta.into_implicit_archive(ArchiveKind::Zip);
        let Metadata::ArchiveManifest { source, client, .. } = &archive else {
            panic!("expected archive manifest, got {archive:?}");
        };
        assert!(client.is_empty());
        assert!(source.client_metadata().unwrap().is_empty());

        let back = archive.clone().into_archive_source();
        assert_eq!(back.kind_name(), "single_redirect");
    }

    #[test]
    fn test_splitfile_max_length() {
        let info = SplitfileInfo {
            segments: vec![],
            data_length: 100,
            uncompressed_length: Some(400),
            compression: Some(CompressionCodec::Zstd),
            client: ClientMetadata::default(),
        };
        assert_eq!(info.max_length(), 400);
        assert_eq!(info.data_block_count(), 0);
    }
}
