//! Subspace block signing and block verification.

use crate::error::{SignerError, SignerResult};
use crate::key::{KeyPair, PublicKey};
use base64::Engine;
use bytes::Bytes;
use cask_core::{ClientUri, Key, KeyBlock, SubspaceKey};
use ed25519_dalek::Signer as _;
use ed25519_dalek::Verifier;

/// Signs blocks into the subspace owned by a key pair.
pub struct SubspaceSigner {
    keypair: KeyPair,
}

impl SubspaceSigner {
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }

    /// Create from a secret key in text form.
    pub fn from_secret_text(s: &str) -> SignerResult<Self> {
        Ok(Self::new(KeyPair::from_secret_text(s)?))
    }

    /// Generate a signer with a fresh random key.
    pub fn generate(label: impl Into<String>) -> Self {
        Self::new(KeyPair::generate(label))
    }

    pub fn label(&self) -> &str {
        &self.keypair.label
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.keypair.public
    }

    pub fn secret_text(&self) -> String {
        self.keypair.to_secret_text()
    }

    /// Key for `doc_name` at `edition` in this subspace.
    pub fn key_for(&self, doc_name: &str, edition: u64) -> SignerResult<SubspaceKey> {
        Ok(SubspaceKey::new(
            self.keypair.public.to_bytes(),
            doc_name,
            edition,
        )?)
    }

    /// URI for `doc_name` at `edition` in this subspace.
    pub fn uri_for(&self, doc_name: &str, edition: u64) -> SignerResult<ClientUri> {
        Ok(ClientUri::from(Key::Subspace(self.key_for(doc_name, edition)?)))
    }

    /// Sign a payload into the slot `doc_name`/`edition`.
    pub fn sign_block(
        &self,
        doc_name: &str,
        edition: u64,
        payload: impl Into<Bytes>,
        is_metadata: bool,
    ) -> SignerResult<KeyBlock> {
        let key = Key::Subspace(self.key_for(doc_name, edition)?);
        let unsigned = KeyBlock::from_parts(key, payload.into(), is_metadata, None);
        let sig = self
            .keypair
            .secret
            .signing_key()
            .sign(&unsigned.signed_message());
        let sig_b64 = base64::engine::general_purpose::STANDARD.encode(sig.to_bytes());
        let (key, payload) = (unsigned.key().clone(), unsigned.payload().clone());
        Ok(KeyBlock::from_parts(key, payload, is_metadata, Some(sig_b64)))
    }
}

/// Verify a block against its key.
///
/// Content blocks are rehashed. Subspace blocks must carry a valid
/// signature by the public key embedded in their key.
pub fn verify_block(block: &KeyBlock) -> SignerResult<()> {
    let subspace = match block.key() {
        Key::Content(_) => {
            return block
                .verify_content()
                .map_err(|e| SignerError::VerificationFailed(e.to_string()));
        }
        Key::Subspace(k) => k,
    };

    let encoded = block
        .signature()
        .ok_or_else(|| SignerError::InvalidSignature("subspace block is unsigned".to_string()))?;
    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| SignerError::InvalidSignature(format!("invalid base64: {e}")))?;
    let sig_array: [u8; 64] = sig_bytes.as_slice().try_into().map_err(|_| {
        SignerError::InvalidSignature(format!("expected 64 bytes, got {}", sig_bytes.len()))
    })?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_array);

    let public = PublicKey::from_bytes(subspace.public_key())?;
    public
        .verifying_key()
        .verify(&block.signed_message(), &signature)
        .map_err(|e| SignerError::VerificationFailed(e.to_string()))
}
