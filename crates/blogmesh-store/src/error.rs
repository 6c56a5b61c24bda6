use blogmesh_types::{Cid, LogAddress};

/// Errors from log and blob store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No reachable node currently provides the log's manifest.
    #[error("log not reachable: {0}")]
    Unreachable(LogAddress),

    /// No reachable node currently holds the blob.
    #[error("blob unavailable: {0}")]
    BlobUnavailable(Cid),

    /// The blob is not held locally.
    #[error("blob not found locally: {0}")]
    NotFound(Cid),

    /// Fetched bytes do not hash to the requested identifier.
    #[error("hash mismatch for blob {0}")]
    HashMismatch(Cid),

    /// The log handle was closed.
    #[error("log closed: {0}")]
    Closed(LogAddress),

    /// A persisted entry could not be decoded.
    #[error("corrupt entry {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    /// A record failed signature verification.
    #[error("invalid record signature: {0}")]
    Signature(#[from] blogmesh_crypto::SignatureError),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Failures that resolve on their own once providers become reachable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unreachable(_) | Self::BlobUnavailable(_) | Self::HashMismatch(_)
        )
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let addr = LogAddress::parse("/log/x").unwrap();
        let cid = Cid::for_bytes(b"x");
        assert!(StoreError::Unreachable(addr.clone()).is_transient());
        assert!(StoreError::BlobUnavailable(cid).is_transient());
        assert!(!StoreError::Closed(addr).is_transient());
        assert!(!StoreError::Serialization("bad".into()).is_transient());
    }
}
