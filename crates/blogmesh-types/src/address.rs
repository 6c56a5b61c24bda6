use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Namespace used when minting addresses for logs created by this node.
pub const DEFAULT_NAMESPACE: &str = "blogmesh";

/// Identifier of a log manifest, written as `/<namespace>/<manifest-identifier>`.
///
/// A `LogAddress` is opaque to everything except the log store that minted
/// it. It is shared between peers out-of-band (copied from a UI field,
/// embedded in a URL fragment) so it must survive a round trip through its
/// string form unchanged. Equality is structural.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogAddress {
    namespace: String,
    manifest: String,
}

impl LogAddress {
    /// Mint an address from the canonical bytes of a log manifest.
    ///
    /// The manifest identifier is the hex BLAKE3 hash of `manifest`, so the
    /// same manifest always produces the same address.
    pub fn mint(namespace: &str, manifest: &[u8]) -> Self {
        Self {
            namespace: namespace.to_owned(),
            manifest: hex::encode(blake3::hash(manifest).as_bytes()),
        }
    }

    /// Parse the `/<namespace>/<manifest-identifier>` form.
    ///
    /// The manifest identifier may itself contain `/` separators, but no
    /// segment may be empty and no whitespace is allowed anywhere.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        let invalid = |reason| TypeError::InvalidAddress {
            address: s.to_owned(),
            reason,
        };
        let rest = s.strip_prefix('/').ok_or_else(|| invalid("must start with '/'"))?;
        if s.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }
        let (namespace, manifest) = rest
            .split_once('/')
            .ok_or_else(|| invalid("missing manifest identifier"))?;
        if namespace.is_empty() {
            return Err(invalid("empty namespace"));
        }
        if manifest.is_empty() || manifest.split('/').any(str::is_empty) {
            return Err(invalid("empty manifest segment"));
        }
        Ok(Self {
            namespace: namespace.to_owned(),
            manifest: manifest.to_owned(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn manifest(&self) -> &str {
        &self.manifest
    }

    /// Short form for log lines: namespace plus the first 8 manifest characters.
    pub fn short(&self) -> String {
        let end = self
            .manifest
            .char_indices()
            .nth(8)
            .map_or(self.manifest.len(), |(i, _)| i);
        format!("/{}/{}", self.namespace, &self.manifest[..end])
    }
}

impl fmt::Display for LogAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.namespace, self.manifest)
    }
}

impl fmt::Debug for LogAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogAddress({self})")
    }
}

impl FromStr for LogAddress {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for LogAddress {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<LogAddress> for String {
    fn from(address: LogAddress) -> Self {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_simple() {
        let a = LogAddress::parse("/log/posts1").unwrap();
        assert_eq!(a.namespace(), "log");
        assert_eq!(a.manifest(), "posts1");
        assert_eq!(a.to_string(), "/log/posts1");
    }

    #[test]
    fn parse_nested_manifest() {
        let a: LogAddress = "/orbitdb/zdpuAbc/settings".parse().unwrap();
        assert_eq!(a.namespace(), "orbitdb");
        assert_eq!(a.manifest(), "zdpuAbc/settings");
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["", "log/posts", "/", "/log", "/log/", "//posts", "/log//x", "/log/a b"] {
            assert!(LogAddress::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn mint_is_deterministic() {
        let a = LogAddress::mint(DEFAULT_NAMESPACE, b"manifest");
        let b = LogAddress::mint(DEFAULT_NAMESPACE, b"manifest");
        let c = LogAddress::mint(DEFAULT_NAMESPACE, b"other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.manifest().len(), 64);
    }

    #[test]
    fn short_form() {
        let a = LogAddress::parse("/log/0123456789abcdef").unwrap();
        assert_eq!(a.short(), "/log/01234567");
        let b = LogAddress::parse("/log/ab").unwrap();
        assert_eq!(b.short(), "/log/ab");
    }

    #[test]
    fn serde_as_string() {
        let a = LogAddress::parse("/log/posts1").unwrap();
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"/log/posts1\"");
        let back: LogAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
        assert!(serde_json::from_str::<LogAddress>("\"nope\"").is_err());
    }

    proptest! {
        #[test]
        fn string_form_round_trips(ns in "[a-z][a-z0-9-]{0,12}", segs in prop::collection::vec("[A-Za-z0-9._-]{1,16}", 1..4)) {
            let s = format!("/{}/{}", ns, segs.join("/"));
            let a = LogAddress::parse(&s).unwrap();
            prop_assert_eq!(a.to_string(), s);
        }
    }
}
