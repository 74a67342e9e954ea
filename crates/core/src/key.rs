//! Keys and client URIs.
//!
//! A [`Key`] names one block on the network. A [`ClientUri`] is a key plus the
//! path components ("meta strings") still to be consumed by manifests.

use crate::hash::{ContentHash, decode_hex32, encode_hex};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const CONTENT_PREFIX: &str = "chk@";
const SUBSPACE_PREFIX: &str = "ssk@";

/// Immutable key derived from the block contents.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentKey {
    hash: ContentHash,
}

impl ContentKey {
    /// Derive the key for a payload. The metadata flag is part of the digest.
    pub fn for_payload(is_metadata: bool, payload: &[u8]) -> Self {
        let flag = [u8::from(is_metadata)];
        Self {
            hash: ContentHash::compute_parts(&[&flag, payload]),
        }
    }

    pub fn from_hash(hash: ContentHash) -> Self {
        Self { hash }
    }

    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({})", &self.hash.to_hex()[..16])
    }
}

/// Mutable slot inside a signed subspace, identified by public key,
/// document name and edition.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubspaceKey {
    public_key: [u8; 32],
    doc_name: String,
    edition: u64,
}

impl SubspaceKey {
    pub fn new(public_key: [u8; 32], doc_name: impl Into<String>, edition: u64) -> Result<Self> {
        let doc_name = doc_name.into();
        if doc_name.is_empty() || doc_name.contains('/') {
            return Err(Error::InvalidKey(format!(
                "invalid document name: {doc_name:?}"
            )));
        }
        Ok(Self {
            public_key,
            doc_name,
            edition,
        })
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn doc_name(&self) -> &str {
        &self.doc_name
    }

    pub fn edition(&self) -> u64 {
        self.edition
    }

    /// Same subspace and document, different edition.
    pub fn with_edition(&self, edition: u64) -> Self {
        Self {
            edition,
            ..self.clone()
        }
    }

    /// Identifies the document across editions.
    pub fn subspace_id(&self) -> (ContentHash, String) {
        (ContentHash::compute(&self.public_key), self.doc_name.clone())
    }

    /// Routing hash over public key, document name and edition.
    pub fn routing_hash(&self) -> ContentHash {
        ContentHash::compute_parts(&[
            &self.public_key,
            self.doc_name.as_bytes(),
            &self.edition.to_be_bytes(),
        ])
    }
}

impl fmt::Debug for SubspaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SubspaceKey({}, {}-{})",
            &encode_hex(&self.public_key)[..16],
            self.doc_name,
            self.edition
        )
    }
}

/// A block identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Key {
    Content(ContentKey),
    Subspace(SubspaceKey),
}

impl Key {
    /// Hash used to locate the block in stores and on the network.
    pub fn routing_hash(&self) -> ContentHash {
        match self {
            Key::Content(k) => *k.hash(),
            Key::Subspace(k) => k.routing_hash(),
        }
    }

    pub fn as_subspace(&self) -> Option<&SubspaceKey> {
        match self {
            Key::Subspace(k) => Some(k),
            Key::Content(_) => None,
        }
    }

    pub fn is_content(&self) -> bool {
        matches!(self, Key::Content(_))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Content(k) => k.fmt(f),
            Key::Subspace(k) => k.fmt(f),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Content(k) => write!(f, "{CONTENT_PREFIX}{}", k.hash().to_hex()),
            Key::Subspace(k) => write!(
                f,
                "{SUBSPACE_PREFIX}{}/{}-{}",
                encode_hex(&k.public_key),
                k.doc_name,
                k.edition
            ),
        }
    }
}

impl From<ContentKey> for Key {
    fn from(k: ContentKey) -> Self {
        Key::Content(k)
    }
}

impl From<SubspaceKey> for Key {
    fn from(k: SubspaceKey) -> Self {
        Key::Subspace(k)
    }
}

/// A key together with the path components left to resolve.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientUri {
    key: Key,
    meta_strings: Vec<String>,
}

impl ClientUri {
    pub fn new(key: Key, meta_strings: Vec<String>) -> Self {
        Self { key, meta_strings }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn meta_strings(&self) -> &[String] {
        &self.meta_strings
    }

    /// The same key with no path components.
    pub fn without_meta_strings(&self) -> Self {
        Self::new(self.key.clone(), Vec::new())
    }

    /// Append one component at the end.
    pub fn push_meta_string(&mut self, name: impl Into<String>) {
        self.meta_strings.push(name.into());
    }

    /// Copy with extra components appended.
    pub fn add_meta_strings<I, S>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = self.clone();
        out.meta_strings.extend(extra.into_iter().map(Into::into));
        out
    }

    /// Copy with the last `n` components removed.
    pub fn drop_last_meta_strings(&self, n: usize) -> Self {
        let keep = self.meta_strings.len().saturating_sub(n);
        Self::new(self.key.clone(), self.meta_strings[..keep].to_vec())
    }

    /// Copy pointing at another edition. Content keys are returned unchanged.
    pub fn with_edition(&self, edition: u64) -> Self {
        match &self.key {
            Key::Subspace(k) => Self::new(Key::Subspace(k.with_edition(edition)), self.meta_strings.clone()),
            Key::Content(_) => self.clone(),
        }
    }
}

impl From<Key> for ClientUri {
    fn from(key: Key) -> Self {
        Self::new(key, Vec::new())
    }
}

impl fmt::Debug for ClientUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientUri({self})")
    }
}

impl fmt::Display for ClientUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        for component in &self.meta_strings {
            write!(f, "/{component}")?;
        }
        Ok(())
    }
}

impl FromStr for ClientUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.get(..4).map(str::to_ascii_lowercase);
        let mut parts = s.split('/');
        let head = parts.next().unwrap_or_default();

        let key = match lower.as_deref() {
            Some(CONTENT_PREFIX) => {
                let hash = ContentHash::from_hex(&head[CONTENT_PREFIX.len()..])
                    .map_err(|e| Error::InvalidUri(format!("{s}: {e}")))?;
                Key::Content(ContentKey::from_hash(hash))
            }
            Some(SUBSPACE_PREFIX) => {
                let public_key = decode_hex32(&head[SUBSPACE_PREFIX.len()..])
                    .map_err(|e| Error::InvalidUri(format!("{s}: {e}")))?;
                let doc = parts
                    .next()
                    .ok_or_else(|| Error::InvalidUri(format!("{s}: missing document name")))?;
                let (name, edition) = doc.rsplit_once('-').ok_or_else(|| {
                    Error::InvalidUri(format!("{s}: expected <doc>-<edition>, got {doc}"))
                })?;
                let edition = edition
                    .parse::<u64>()
                    .map_err(|e| Error::InvalidUri(format!("{s}: bad edition: {e}")))?;
                Key::Subspace(SubspaceKey::new(public_key, name, edition)?)
            }
            _ => return Err(Error::InvalidUri(format!("unknown key type: {s}"))),
        };

        Ok(Self::new(key, parts.map(str::to_string).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content_uri() -> ClientUri {
        let key = ContentKey::for_payload(false, b"hello");
        ClientUri::from(Key::from(key))
    }

    #[test]
    fn test_content_uri_parse_display() {
        let uri = content_uri().add_meta_strings(["docs", "index.html"]);
        let text = uri.to_string();
        assert!(text.starts_with("chk@"));
        let parsed: ClientUri = text.parse().unwrap();
        assert_eq!(parsed, uri);
        assert_eq!(parsed.meta_strings(), ["docs", "index.html"]);
    }

    #[test]
    fn test_trailing_slash_is_empty_component() {
        let text = format!("{}/", content_uri());
        let parsed: ClientUri = text.parse().unwrap();
        assert_eq!(parsed.meta_strings(), [""]);
    }

    #[test]
    fn test_subspace_uri_parse() {
        let key = SubspaceKey::new([7u8; 32], "my-site", 12).unwrap();
        let uri = ClientUri::from(Key::from(key.clone())).add_meta_strings(["a"]);
        let parsed: ClientUri = uri.to_string().parse().unwrap();
        let parsed_key = parsed.key().as_subspace().unwrap();
        assert_eq!(parsed_key.doc_name(), "my-site");
        assert_eq!(parsed_key.edition(), 12);
        assert_eq!(parsed.meta_strings(), ["a"]);
    }

    #[test]
    fn test_drop_last_meta_strings() {
        let uri = content_uri().add_meta_strings(["a", "b", "c"]);
        assert_eq!(uri.drop_last_meta_strings(2).meta_strings(), ["a"]);
        assert!(uri.drop_last_meta_strings(10).meta_strings().is_empty());
    }

    #[test]
    fn test_with_edition_keeps_subspace() {
        let key = SubspaceKey::new([1u8; 32], "doc", 1).unwrap();
        let newer = ClientUri::from(Key::from(key.clone())).with_edition(5);
        let newer_key = newer.key().as_subspace().unwrap();
        assert_eq!(newer_key.edition(), 5);
        assert_eq!(newer_key.subspace_id(), key.subspace_id());
        assert_ne!(newer_key.routing_hash(), key.routing_hash());
    }

    #[test]
    fn test_metadata_flag_changes_content_key() {
        assert_ne!(
            ContentKey::for_payload(true, b"x"),
            ContentKey::for_payload(false, b"x")
        );
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        assert!("ftp@abc".parse::<ClientUri>().is_err());
        assert!("ssk@00/doc".parse::<ClientUri>().is_err());
    }
}
