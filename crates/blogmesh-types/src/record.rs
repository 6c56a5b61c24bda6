use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TypeError;

/// Operation carried by a log record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Op {
    Put,
    Del,
}

/// Hex-encoded public key of the identity that authored a record.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKeyRef(String);

impl PublicKeyRef {
    pub fn from_bytes(key: &[u8; 32]) -> Self {
        Self(hex::encode(key))
    }

    /// Decode back to the raw 32-byte key.
    pub fn to_bytes(&self) -> Result<[u8; 32], TypeError> {
        let bytes = hex::decode(&self.0).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        bytes.try_into().map_err(|b: Vec<u8>| TypeError::InvalidLength {
            expected: 32,
            actual: b.len(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PublicKeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKeyRef({})", &self.0[..self.0.len().min(8)])
    }
}

impl fmt::Display for PublicKeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One signed entry of an append-only log.
///
/// `clock` is the author's Lamport time when the record was written; it
/// orders concurrent writes to the same key when the log is materialized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub key: String,
    pub value: Value,
    pub op: Op,
    pub identity: PublicKeyRef,
    pub clock: u64,
    /// Hex-encoded signature over [`LogRecord::signing_payload`].
    pub signature: String,
}

impl LogRecord {
    /// Canonical bytes an identity signs for a record.
    pub fn signing_payload(key: &str, value: &Value, op: Op, clock: u64) -> Vec<u8> {
        // serde_json maps are ordered, so the encoding is canonical.
        let mut out = b"blogmesh-record-v1:".to_vec();
        out.extend_from_slice(
            serde_json::to_string(&(key, value, op, clock))
                .unwrap_or_default()
                .as_bytes(),
        );
        out
    }

    /// The payload this record's signature must cover.
    pub fn payload(&self) -> Vec<u8> {
        Self::signing_payload(&self.key, &self.value, self.op, self.clock)
    }

    /// Stable identifier of this entry, used to deduplicate replicas.
    pub fn entry_id(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.identity.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(&self.clock.to_be_bytes());
        hasher.update(b":");
        hasher.update(self.key.as_bytes());
        *hasher.finalize().as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(key: &str, clock: u64) -> LogRecord {
        LogRecord {
            key: key.into(),
            value: json!({"title": "T"}),
            op: Op::Put,
            identity: PublicKeyRef::from_bytes(&[1; 32]),
            clock,
            signature: String::new(),
        }
    }

    #[test]
    fn op_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Op::Put).unwrap(), "\"PUT\"");
        assert_eq!(serde_json::from_str::<Op>("\"DEL\"").unwrap(), Op::Del);
    }

    #[test]
    fn public_key_ref_round_trip() {
        let key = [9u8; 32];
        let r = PublicKeyRef::from_bytes(&key);
        assert_eq!(r.to_bytes().unwrap(), key);
        assert_eq!(r.as_str().len(), 64);
    }

    #[test]
    fn public_key_ref_rejects_short() {
        let r: PublicKeyRef = serde_json::from_str("\"abcd\"").unwrap();
        assert!(matches!(r.to_bytes(), Err(TypeError::InvalidLength { .. })));
    }

    #[test]
    fn signing_payload_depends_on_every_field() {
        let base = LogRecord::signing_payload("k", &json!(1), Op::Put, 1);
        assert_ne!(base, LogRecord::signing_payload("j", &json!(1), Op::Put, 1));
        assert_ne!(base, LogRecord::signing_payload("k", &json!(2), Op::Put, 1));
        assert_ne!(base, LogRecord::signing_payload("k", &json!(1), Op::Del, 1));
        assert_ne!(base, LogRecord::signing_payload("k", &json!(1), Op::Put, 2));
    }

    #[test]
    fn entry_id_distinguishes_clock_and_key() {
        assert_eq!(record("a", 1).entry_id(), record("a", 1).entry_id());
        assert_ne!(record("a", 1).entry_id(), record("a", 2).entry_id());
        assert_ne!(record("a", 1).entry_id(), record("b", 1).entry_id());
    }

    #[test]
    fn record_json_shape() {
        let v = serde_json::to_value(record("p1", 3)).unwrap();
        assert_eq!(v["op"], "PUT");
        assert_eq!(v["clock"], 3);
        assert_eq!(v["value"]["title"], "T");
    }
}
