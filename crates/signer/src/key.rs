//! Ed25519 key types for signed subspaces.
//!
//! Keys are stored as text: `label:base64(secret || public)` for secret
//! keys and `label:base64(public)` for public keys.

use crate::error::{SignerError, SignerResult};
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::fmt;

/// A secret (private) key for signing subspace blocks.
pub struct SecretKey {
    inner: SigningKey,
}

impl SecretKey {
    /// Generate a new random secret key.
    pub fn generate() -> Self {
        let mut rng = rand_core::OsRng;
        Self {
            inner: SigningKey::generate(&mut rng),
        }
    }

    /// Parse `label:base64(secret || public)`.
    pub fn from_text(s: &str) -> SignerResult<(String, Self)> {
        let (label, bytes) = split_labelled(s)?;
        if bytes.len() != 64 {
            return Err(SignerError::KeyParsing(format!(
                "expected 64 bytes, got {}",
                bytes.len()
            )));
        }

        let secret_bytes: [u8; 32] = bytes[..32]
            .try_into()
            .map_err(|_| SignerError::KeyParsing("invalid secret key bytes".to_string()))?;
        let inner = SigningKey::from_bytes(&secret_bytes);

        if inner.verifying_key().as_bytes()[..] != bytes[32..] {
            return Err(SignerError::KeyParsing(
                "public half does not match secret key".to_string(),
            ));
        }

        Ok((label, Self { inner }))
    }

    /// Encode as `label:base64(secret || public)`.
    pub fn to_text(&self, label: &str) -> String {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(self.inner.as_bytes());
        bytes.extend_from_slice(self.inner.verifying_key().as_bytes());
        let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
        format!("{label}:{b64}")
    }

    /// Get the corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.verifying_key(),
        }
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.inner
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// A public key identifying a subspace.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    /// Build from the 32 raw bytes embedded in a subspace key.
    pub fn from_bytes(bytes: &[u8; 32]) -> SignerResult<Self> {
        let inner = VerifyingKey::from_bytes(bytes)
            .map_err(|e| SignerError::KeyParsing(format!("invalid public key: {e}")))?;
        Ok(Self { inner })
    }

    /// Parse `label:base64(public)`.
    pub fn from_text(s: &str) -> SignerResult<(String, Self)> {
        let (label, bytes) = split_labelled(s)?;
        let key_bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            SignerError::KeyParsing(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok((label, Self::from_bytes(&key_bytes)?))
    }

    /// Encode as `label:base64(public)`.
    pub fn to_text(&self, label: &str) -> String {
        let b64 = base64::engine::general_purpose::STANDARD.encode(self.inner.as_bytes());
        format!("{label}:{b64}")
    }

    /// Raw bytes, as embedded in subspace keys.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    pub(crate) fn verifying_key(&self) -> &VerifyingKey {
        &self.inner
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b64 = base64::engine::general_purpose::STANDARD.encode(self.inner.as_bytes());
        write!(f, "PublicKey({}...)", &b64[..8])
    }
}

/// A labelled key pair owning one subspace.
pub struct KeyPair {
    /// Human-readable label, e.g. "my-site".
    pub label: String,
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new key pair with the given label.
    pub fn generate(label: impl Into<String>) -> Self {
        let secret = SecretKey::generate();
        let public = secret.public_key();
        Self {
            label: label.into(),
            secret,
            public,
        }
    }

    /// Parse a secret key in text form.
    pub fn from_secret_text(s: &str) -> SignerResult<Self> {
        let (label, secret) = SecretKey::from_text(s)?;
        let public = secret.public_key();
        Ok(Self {
            label,
            secret,
            public,
        })
    }

    pub fn to_secret_text(&self) -> String {
        self.secret.to_text(&self.label)
    }

    pub fn to_public_text(&self) -> String {
        self.public.to_text(&self.label)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("label", &self.label)
            .field("public", &self.public)
            .finish()
    }
}

fn split_labelled(s: &str) -> SignerResult<(String, Vec<u8>)> {
    let (label, b64) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| SignerError::KeyParsing("expected 'label:base64' format".to_string()))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| SignerError::KeyParsing(format!("invalid base64: {e}")))?;
    Ok((label.to_string(), bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_key_text_form() {
        let keypair = KeyPair::generate("site");
        let parsed = KeyPair::from_secret_text(&keypair.to_secret_text()).unwrap();
        assert_eq!(parsed.label, "site");
        assert_eq!(parsed.public, keypair.public);
    }

    #[test]
    fn test_public_key_text_form() {
        let keypair = KeyPair::generate("site");
        let (label, public) = PublicKey::from_text(&keypair.to_public_text()).unwrap();
        assert_eq!(label, "site");
        assert_eq!(public.to_bytes(), keypair.public.to_bytes());
    }

    #[test]
    fn test_rejects_mismatched_halves() {
        let a = KeyPair::generate("a");
        let b = KeyPair::generate("b");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(a.secret.signing_key().as_bytes());
        bytes.extend_from_slice(&b.public.to_bytes());
        let text = format!(
            "x:{}",
            base64::engine::general_purpose::STANDARD.encode(&bytes)
        );
        assert!(SecretKey::from_text(&text).is_err());
    }

    #[test]
    fn test_rejects_missing_label() {
        assert!(PublicKey::from_text("bm9sYWJlbA==").is_err());
    }
}
