use std::net::SocketAddr;

use async_trait::async_trait;
use blogmesh_types::PeerId;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::NetResult;

/// Connection lifecycle event reported by a [`PeerLink`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    /// A peer became known, possibly with addresses to dial it at.
    Discovered { peer: PeerId, addrs: Vec<SocketAddr> },
    Connected { peer: PeerId },
    Disconnected { peer: PeerId },
}

impl PeerEvent {
    pub fn peer(&self) -> &PeerId {
        match self {
            Self::Discovered { peer, .. } | Self::Connected { peer } | Self::Disconnected { peer } => {
                peer
            }
        }
    }
}

/// A message received on a pub/sub topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicMessage {
    pub from: PeerId,
    pub topic: String,
    pub data: Bytes,
}

/// Answer to an identify request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentifyInfo {
    pub peer: PeerId,
    /// Protocol strings the peer advertises.
    pub protocols: Vec<String>,
}

/// Peer transport capability.
///
/// Events are delivered over a broadcast channel; a receiver that falls
/// behind sees `RecvError::Lagged` and must cope with the gap.
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn local_peer(&self) -> PeerId;

    /// Subscribe to connection lifecycle events.
    fn events(&self) -> broadcast::Receiver<PeerEvent>;

    /// Connect to `peer`. A no-op if already connected.
    async fn dial(&self, peer: &PeerId, addrs: &[SocketAddr]) -> NetResult<()>;

    /// Currently connected peers.
    fn connections(&self) -> Vec<PeerId>;

    /// Ask a connected peer which protocols it advertises.
    async fn identify(&self, peer: &PeerId) -> NetResult<IdentifyInfo>;

    /// Send `data` to every connected peer subscribed to `topic`.
    async fn publish(&self, topic: &str, data: Bytes) -> NetResult<()>;

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<TopicMessage>;

    /// Add a protocol to what this node reports on identify.
    fn advertise(&self, protocol: String);

    fn advertised(&self) -> Vec<String>;
}
