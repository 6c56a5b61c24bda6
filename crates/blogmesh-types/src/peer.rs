use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Identifier of a peer on the network.
///
/// A `PeerId` is derived deterministically from the peer's Ed25519 public
/// key using BLAKE3, so the same key always produces the same identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId {
    hash: [u8; 32],
}

impl PeerId {
    /// Derive a `PeerId` from a 32-byte public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"blogmesh-peer-v1:");
        hasher.update(public_key);
        Self {
            hash: *hasher.finalize().as_bytes(),
        }
    }

    /// Create from a raw 32-byte hash. Use `from_public_key()` for real peers.
    pub fn from_raw(hash: [u8; 32]) -> Self {
        Self { hash }
    }

    /// The raw 32-byte hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.hash
    }

    /// Full hex-encoded string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Short identifier (first 8 hex characters).
    pub fn short_id(&self) -> String {
        format!("peer:{}", hex::encode(&self.hash[..4]))
    }

    /// Parse from a hex string (64 hex characters, optional `peer:` prefix).
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let s = s.strip_prefix("peer:").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(TypeError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self { hash: arr })
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short_id())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_id())
    }
}

impl FromStr for PeerId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic() {
        let a = PeerId::from_public_key(&[42u8; 32]);
        let b = PeerId::from_public_key(&[42u8; 32]);
        assert_eq!(a, b);
        assert_ne!(a, PeerId::from_public_key(&[43u8; 32]));
    }

    #[test]
    fn derived_differs_from_raw_key() {
        let key = [7u8; 32];
        assert_ne!(PeerId::from_public_key(&key), PeerId::from_raw(key));
    }

    #[test]
    fn short_id_format() {
        let id = PeerId::from_raw([0xab; 32]);
        assert_eq!(id.short_id(), "peer:abababab");
        assert_eq!(id.to_string(), "peer:abababab");
    }

    #[test]
    fn hex_round_trip() {
        let id = PeerId::from_public_key(&[1u8; 32]);
        assert_eq!(PeerId::from_hex(&id.to_hex()).unwrap(), id);
        assert_eq!(format!("peer:{}", id.to_hex()).parse::<PeerId>().unwrap(), id);
    }

    #[test]
    fn from_hex_wrong_length() {
        assert!(matches!(
            PeerId::from_hex("abcd"),
            Err(TypeError::InvalidLength { expected: 32, actual: 2 })
        ));
    }
}
