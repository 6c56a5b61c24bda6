use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Content identifier of an immutable blob.
///
/// A `Cid` is the BLAKE3 hash of the blob's bytes. Identical content always
/// produces the same `Cid`; blobs are created and fetched but never mutated.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cid([u8; 32]);

impl Cid {
    /// Compute the `Cid` of raw bytes.
    pub fn for_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create a `Cid` from a pre-computed hash.
    pub fn from_hash(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// Returns `true` if `data` hashes to this identifier.
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::for_bytes(data) == *self
    }

    /// The raw 32-byte hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(TypeError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self.short_hex())
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Cid {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s.trim())
    }
}

impl TryFrom<String> for Cid {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Cid> for String {
    fn from(cid: Cid) -> Self {
        cid.to_hex()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_bytes_is_deterministic() {
        assert_eq!(Cid::for_bytes(b"hello"), Cid::for_bytes(b"hello"));
        assert_ne!(Cid::for_bytes(b"hello"), Cid::for_bytes(b"world"));
    }

    #[test]
    fn verify_matches_content() {
        let cid = Cid::for_bytes(b"image bytes");
        assert!(cid.verify(b"image bytes"));
        assert!(!cid.verify(b"image bytez"));
    }

    #[test]
    fn hex_round_trip() {
        let cid = Cid::for_bytes(b"data");
        let parsed: Cid = cid.to_string().parse().unwrap();
        assert_eq!(parsed, cid);
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(matches!(Cid::from_hex("zz"), Err(TypeError::InvalidHex(_))));
        assert_eq!(
            Cid::from_hex("abcd"),
            Err(TypeError::InvalidLength { expected: 32, actual: 2 })
        );
    }

    #[test]
    fn debug_is_short() {
        let cid = Cid::from_hash([0xab; 32]);
        assert_eq!(format!("{cid:?}"), "Cid(abababab)");
    }
}
