//! Key blocks: the unit of storage and transfer.

use crate::key::{ContentKey, Key};
use crate::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A block fetched for a key.
///
/// Content blocks are self-verifying. Subspace blocks carry a base64
/// Ed25519 signature checked by `cask-signer`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBlock {
    key: Key,
    payload: Bytes,
    is_metadata: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

impl KeyBlock {
    /// Build a content block, deriving its key from the payload.
    pub fn content(payload: impl Into<Bytes>, is_metadata: bool) -> Self {
        let payload = payload.into();
        let key = Key::Content(ContentKey::for_payload(is_metadata, &payload));
        Self {
            key,
            payload,
            is_metadata,
            signature: None,
        }
    }

    /// Assemble a block from already-known parts. Used by signers and decoders.
    pub fn from_parts(
        key: Key,
        payload: Bytes,
        is_metadata: bool,
        signature: Option<String>,
    ) -> Self {
        Self {
            key,
            payload,
            is_metadata,
            signature,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_metadata(&self) -> bool {
        self.is_metadata
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// Bytes covered by a subspace signature: routing hash, flag, payload.
    pub fn signed_message(&self) -> Vec<u8> {
        let routing = self.key.routing_hash();
        let mut msg = Vec::with_capacity(33 + self.payload.len());
        msg.extend_from_slice(routing.as_bytes());
        msg.push(u8::from(self.is_metadata));
        msg.extend_from_slice(&self.payload);
        msg
    }

    /// Check a content block against its key. Subspace blocks are rejected
    /// here; their signatures are verified by the signer crate.
    pub fn verify_content(&self) -> Result<()> {
        let Key::Content(expected) = &self.key else {
            return Err(Error::InvalidKey(
                "subspace blocks need signature verification".to_string(),
            ));
        };
        let actual = ContentKey::for_payload(self.is_metadata, &self.payload);
        if actual != *expected {
            return Err(Error::HashMismatch {
                expected: expected.hash().to_hex(),
                actual: actual.hash().to_hex(),
            });
        }
        Ok(())
    }

    /// Encode for on-disk storage.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode from on-disk storage.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::Serialization(e.to_string()))
    }
}

impl fmt::Debug for KeyBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBlock")
            .field("key", &self.key)
            .field("len", &self.payload.len())
            .field("is_metadata", &self.is_metadata)
            .field("signed", &self.signature.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_block_verifies() {
        let block = KeyBlock::content(Bytes::from_static(b"data"), false);
        block.verify_content().unwrap();
    }

    #[test]
    fn test_tampered_block_fails() {
        let block = KeyBlock::content(Bytes::from_static(b"data"), false);
        let tampered = KeyBlock::from_parts(
            block.key().clone(),
            Bytes::from_static(b"evil"),
            false,
            None,
        );
        assert!(matches!(
            tampered.verify_content(),
            Err(Error::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_json_encoding() {
        let block = KeyBlock::content(Bytes::from_static(b"{}"), true);
        let decoded = KeyBlock::from_json(&block.to_json().unwrap()).unwrap();
        assert_eq!(decoded, block);
        assert!(decoded.is_metadata());
    }
}
