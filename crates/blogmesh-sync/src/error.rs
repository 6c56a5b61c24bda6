use std::sync::Arc;

use blogmesh_store::StoreError;
use blogmesh_types::LogAddress;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Every caller waiting on the same open attempt shares its error.
    #[error("failed to open {address}: {source}")]
    Open {
        address: LogAddress,
        source: Arc<StoreError>,
    },
}

impl SyncError {
    /// Whether a later trigger may succeed where this attempt failed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Open { source, .. } => source.is_transient(),
        }
    }

    /// The underlying store failure.
    pub fn store_error(&self) -> &StoreError {
        match self {
            Self::Open { source, .. } => source,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
