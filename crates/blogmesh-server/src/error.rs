use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("store error: {0}")]
    Store(#[from] blogmesh_store::StoreError),

    #[error("network error: {0}")]
    Net(#[from] blogmesh_net::NetError),

    #[error("metrics error: {0}")]
    Metrics(#[from] blogmesh_metrics::MetricsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;
