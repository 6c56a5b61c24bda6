use blogmesh_types::{LogRecord, Op, PeerId, PublicKeyRef};
use serde_json::Value;

use crate::signer::{Signature, SignatureError, SigningKey, VerifyingKey};

/// Capability to author log records.
///
/// Implementations own a private key and never expose it; consumers only
/// sign payloads and learn the public key reference.
pub trait Identity: Send + Sync {
    /// Reference to the public half, stored in each authored record.
    fn public_key(&self) -> PublicKeyRef;

    /// Sign an arbitrary payload.
    fn sign(&self, payload: &[u8]) -> Signature;
}

/// Ed25519 identity backed by an in-memory signing key.
#[derive(Debug)]
pub struct KeypairIdentity {
    key: SigningKey,
}

impl KeypairIdentity {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(),
        }
    }

    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(secret),
        }
    }

    /// Raw secret bytes, for persisting the node identity.
    pub fn secret_bytes(&self) -> [u8; 32] {
        *self.key.as_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn peer_id(&self) -> PeerId {
        self.key.verifying_key().to_peer_id()
    }
}

impl Identity for KeypairIdentity {
    fn public_key(&self) -> PublicKeyRef {
        self.key.verifying_key().to_public_key_ref()
    }

    fn sign(&self, payload: &[u8]) -> Signature {
        self.key.sign(payload)
    }
}

/// Author a record: sign the canonical payload with `identity`.
pub fn sign_record(
    identity: &dyn Identity,
    key: impl Into<String>,
    value: Value,
    op: Op,
    clock: u64,
) -> LogRecord {
    let key = key.into();
    let signature = identity.sign(&LogRecord::signing_payload(&key, &value, op, clock));
    LogRecord {
        key,
        value,
        op,
        identity: identity.public_key(),
        clock,
        signature: signature.to_hex(),
    }
}

/// Check that a record's signature was produced by the identity it names.
pub fn verify_record(record: &LogRecord) -> Result<(), SignatureError> {
    let key = VerifyingKey::from_public_key_ref(&record.identity)?;
    let signature = Signature::from_hex(&record.signature)?;
    key.verify(&record.payload(), &signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signed_record_verifies() {
        let id = KeypairIdentity::generate();
        let rec = sign_record(&id, "blogName", json!("B"), Op::Put, 1);
        assert_eq!(rec.identity, id.public_key());
        assert!(verify_record(&rec).is_ok());
    }

    #[test]
    fn tampered_value_fails() {
        let id = KeypairIdentity::generate();
        let mut rec = sign_record(&id, "blogName", json!("B"), Op::Put, 1);
        rec.value = json!("Evil");
        assert_eq!(verify_record(&rec), Err(SignatureError::InvalidSignature));
    }

    #[test]
    fn foreign_identity_fails() {
        let a = KeypairIdentity::generate();
        let b = KeypairIdentity::generate();
        let mut rec = sign_record(&a, "k", json!(1), Op::Put, 1);
        rec.identity = b.public_key();
        assert!(verify_record(&rec).is_err());
    }

    #[test]
    fn garbage_signature_is_malformed() {
        let id = KeypairIdentity::generate();
        let mut rec = sign_record(&id, "k", json!(1), Op::Del, 2);
        rec.signature = "not-hex".into();
        assert_eq!(verify_record(&rec), Err(SignatureError::MalformedSignature));
    }

    #[test]
    fn secret_round_trip_keeps_peer_id() {
        let id = KeypairIdentity::generate();
        let restored = KeypairIdentity::from_secret(id.secret_bytes());
        assert_eq!(restored.peer_id(), id.peer_id());
        assert_eq!(restored.public_key(), id.public_key());
    }
}
