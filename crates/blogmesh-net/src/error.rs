use std::io;
use std::net::SocketAddr;

use blogmesh_types::PeerId;

/// Errors produced by peer links and discovery.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// No route to the peer, or every known address refused.
    #[error("dial to {peer} failed: {reason}")]
    DialFailed { peer: PeerId, reason: String },

    /// Connecting to a socket address did not complete in time.
    #[error("connection to {0} timed out")]
    ConnectTimeout(SocketAddr),

    /// The operation needs an open connection to the peer.
    #[error("not connected to {0}")]
    NotConnected(PeerId),

    /// The peer does not answer identify requests.
    #[error("{0} does not support identify")]
    UnsupportedProtocol(PeerId),

    /// The peer did not answer an identify request in time.
    #[error("identify of {0} timed out")]
    IdentifyTimeout(PeerId),

    /// The remote sent something other than the expected handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Malformed frame on the wire.
    #[error("framing error: {0}")]
    Framing(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The link has been shut down.
    #[error("link is shut down")]
    Shutdown,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl NetError {
    /// Whether the failure may clear up on its own (peer comes back, retry later).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DialFailed { .. }
                | Self::ConnectTimeout(_)
                | Self::NotConnected(_)
                | Self::UnsupportedProtocol(_)
                | Self::IdentifyTimeout(_)
                | Self::Io(_)
        )
    }
}

/// Convenience alias used throughout the net crate.
pub type NetResult<T> = std::result::Result<T, NetError>;
