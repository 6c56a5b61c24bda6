use std::fmt;

use blogmesh_types::{PeerId, PublicKeyRef};
use ed25519_dalek::{Signer, Verifier};

/// Errors from signing and record verification.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature does not match the record")]
    InvalidSignature,
    #[error("identity is not a valid Ed25519 public key")]
    InvalidKey,
    #[error("signature is not 64 hex-encoded bytes")]
    MalformedSignature,
}

/// Node secret. Never leaves [`crate::KeypairIdentity`] except to be persisted.
pub struct SigningKey(ed25519_dalek::SigningKey);

/// Public half of a node identity; names the author of a record.
#[derive(Clone, PartialEq, Eq)]
pub struct VerifyingKey(ed25519_dalek::VerifyingKey);

/// Record signature, carried hex-encoded in `LogRecord::signature`.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl SigningKey {
    pub fn generate() -> Self {
        Self(ed25519_dalek::SigningKey::generate(&mut rand::thread_rng()))
    }

    pub fn from_bytes(secret: [u8; 32]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(&secret))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(self.0.verifying_key())
    }

    pub fn sign(&self, payload: &[u8]) -> Signature {
        Signature(self.0.sign(payload))
    }
}

impl VerifyingKey {
    /// Decode the key a record names as its author.
    pub fn from_public_key_ref(key: &PublicKeyRef) -> Result<Self, SignatureError> {
        let bytes = key.to_bytes().map_err(|_| SignatureError::InvalidKey)?;
        ed25519_dalek::VerifyingKey::from_bytes(&bytes)
            .map(Self)
            .map_err(|_| SignatureError::InvalidKey)
    }

    pub fn to_public_key_ref(&self) -> PublicKeyRef {
        PublicKeyRef::from_bytes(&self.0.to_bytes())
    }

    /// Peer id announced by a node holding this key.
    pub fn to_peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.0.to_bytes())
    }

    pub fn verify(&self, payload: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.0
            .verify(payload, &signature.0)
            .map_err(|_| SignatureError::InvalidSignature)
    }
}

impl Signature {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, SignatureError> {
        let bytes: [u8; 64] = hex::decode(s)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or(SignatureError::MalformedSignature)?;
        Ok(Self(ed25519_dalek::Signature::from_bytes(&bytes)))
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

impl fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerifyingKey({})", self.to_public_key_ref())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "Signature({}..)", &hex[..16])
    }
}
