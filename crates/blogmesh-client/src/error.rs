use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The log and blob stores have not been attached yet.
    #[error("client not initialized: no log or blob store attached")]
    NotInitialized,

    #[error("acquisition cancelled")]
    Cancelled,

    #[error("blog not available after {0:?}")]
    Timeout(Duration),

    #[error("store error: {0}")]
    Store(#[from] blogmesh_store::StoreError),
}

pub type ClientResult<T> = Result<T, ClientError>;
