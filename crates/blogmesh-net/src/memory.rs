use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use blogmesh_types::PeerId;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{NetError, NetResult};
use crate::link::{IdentifyInfo, PeerEvent, PeerLink, TopicMessage};

const EVENT_CAPACITY: usize = 256;
const TOPIC_CAPACITY: usize = 256;

/// How a [`MemoryPeerLink`] answers identify requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentifyMode {
    /// Reply with the advertised protocols.
    Supported,
    /// Reject the request as unsupported.
    Unsupported,
    /// Never reply.
    Silent,
}

impl IdentifyMode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Unsupported,
            2 => Self::Silent,
            _ => Self::Supported,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Supported => 0,
            Self::Unsupported => 1,
            Self::Silent => 2,
        }
    }
}

/// In-process switchboard connecting [`MemoryPeerLink`]s.
#[derive(Clone, Default)]
pub struct MemorySwarm {
    peers: Arc<RwLock<HashMap<PeerId, Arc<LinkShared>>>>,
}

struct LinkShared {
    peer: PeerId,
    events: broadcast::Sender<PeerEvent>,
    connections: RwLock<HashSet<PeerId>>,
    protocols: RwLock<BTreeSet<String>>,
    topics: RwLock<HashMap<String, broadcast::Sender<TopicMessage>>>,
    dialable: AtomicBool,
    identify: AtomicU8,
}

impl LinkShared {
    fn emit(&self, event: PeerEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn topic_sender(&self, topic: &str) -> broadcast::Sender<TopicMessage> {
        let mut topics = self.topics.write().expect("topics lock poisoned");
        topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

impl MemorySwarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer to the swarm and return its link.
    pub fn join(&self, peer: PeerId) -> MemoryPeerLink {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(LinkShared {
            peer,
            events,
            connections: RwLock::new(HashSet::new()),
            protocols: RwLock::new(BTreeSet::new()),
            topics: RwLock::new(HashMap::new()),
            dialable: AtomicBool::new(true),
            identify: AtomicU8::new(IdentifyMode::Supported.as_u8()),
        });
        self.peers
            .write()
            .expect("swarm lock poisoned")
            .insert(peer, shared.clone());
        MemoryPeerLink {
            swarm: self.clone(),
            shared,
        }
    }

    fn get(&self, peer: &PeerId) -> Option<Arc<LinkShared>> {
        self.peers
            .read()
            .expect("swarm lock poisoned")
            .get(peer)
            .cloned()
    }
}

impl std::fmt::Debug for MemorySwarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.peers.read().expect("swarm lock poisoned").len();
        f.debug_struct("MemorySwarm").field("peers", &count).finish()
    }
}

/// A peer's link into a [`MemorySwarm`].
#[derive(Clone)]
pub struct MemoryPeerLink {
    swarm: MemorySwarm,
    shared: Arc<LinkShared>,
}

impl MemoryPeerLink {
    /// Whether other peers can dial this one.
    pub fn set_dialable(&self, dialable: bool) {
        self.shared.dialable.store(dialable, Ordering::SeqCst);
    }

    pub fn set_identify_mode(&self, mode: IdentifyMode) {
        self.shared.identify.store(mode.as_u8(), Ordering::SeqCst);
    }

    /// Tell `to` about this peer, as a discovery service would.
    pub fn announce_to(&self, to: &PeerId) {
        if let Some(target) = self.swarm.get(to) {
            target.emit(PeerEvent::Discovered {
                peer: self.shared.peer,
                addrs: Vec::new(),
            });
        }
    }

    /// Drop the connection to `peer`, notifying both sides.
    pub fn disconnect(&self, peer: &PeerId) {
        let removed = self
            .shared
            .connections
            .write()
            .expect("connections lock poisoned")
            .remove(peer);
        if !removed {
            return;
        }
        if let Some(remote) = self.swarm.get(peer) {
            remote
                .connections
                .write()
                .expect("connections lock poisoned")
                .remove(&self.shared.peer);
            remote.emit(PeerEvent::Disconnected {
                peer: self.shared.peer,
            });
        }
        self.shared.emit(PeerEvent::Disconnected { peer: *peer });
        debug!(local = %self.shared.peer, remote = %peer, "disconnected");
    }

    /// Drop every connection.
    pub fn disconnect_all(&self) {
        for peer in self.connections() {
            self.disconnect(&peer);
        }
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.shared
            .connections
            .read()
            .expect("connections lock poisoned")
            .contains(peer)
    }
}

impl std::fmt::Debug for MemoryPeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPeerLink")
            .field("peer", &self.shared.peer)
            .finish()
    }
}

#[async_trait]
impl PeerLink for MemoryPeerLink {
    fn local_peer(&self) -> PeerId {
        self.shared.peer
    }

    fn events(&self) -> broadcast::Receiver<PeerEvent> {
        self.shared.events.subscribe()
    }

    async fn dial(&self, peer: &PeerId, _addrs: &[SocketAddr]) -> NetResult<()> {
        if self.is_connected(peer) {
            return Ok(());
        }
        let remote = self
            .swarm
            .get(peer)
            .filter(|r| r.dialable.load(Ordering::SeqCst) && r.peer != self.shared.peer)
            .ok_or_else(|| NetError::DialFailed {
                peer: *peer,
                reason: "peer unreachable".into(),
            })?;

        self.shared
            .connections
            .write()
            .expect("connections lock poisoned")
            .insert(*peer);
        remote
            .connections
            .write()
            .expect("connections lock poisoned")
            .insert(self.shared.peer);
        self.shared.emit(PeerEvent::Connected { peer: *peer });
        remote.emit(PeerEvent::Connected {
            peer: self.shared.peer,
        });
        debug!(local = %self.shared.peer, remote = %peer, "connected");
        Ok(())
    }

    fn connections(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .shared
            .connections
            .read()
            .expect("connections lock poisoned")
            .iter()
            .copied()
            .collect();
        peers.sort();
        peers
    }

    async fn identify(&self, peer: &PeerId) -> NetResult<IdentifyInfo> {
        if !self.is_connected(peer) {
            return Err(NetError::NotConnected(*peer));
        }
        let remote = self.swarm.get(peer).ok_or(NetError::NotConnected(*peer))?;
        match IdentifyMode::from_u8(remote.identify.load(Ordering::SeqCst)) {
            IdentifyMode::Supported => {
                let protocols = remote
                    .protocols
                    .read()
                    .expect("protocols lock poisoned")
                    .iter()
                    .cloned()
                    .collect();
                Ok(IdentifyInfo {
                    peer: *peer,
                    protocols,
                })
            }
            IdentifyMode::Unsupported => Err(NetError::UnsupportedProtocol(*peer)),
            IdentifyMode::Silent => std::future::pending().await,
        }
    }

    async fn publish(&self, topic: &str, data: Bytes) -> NetResult<()> {
        for peer in self.connections() {
            let Some(remote) = self.swarm.get(&peer) else {
                continue;
            };
            let sender = remote
                .topics
                .read()
                .expect("topics lock poisoned")
                .get(topic)
                .cloned();
            if let Some(sender) = sender {
                let _ = sender.send(TopicMessage {
                    from: self.shared.peer,
                    topic: topic.to_owned(),
                    data: data.clone(),
                });
            }
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<TopicMessage> {
        self.shared.topic_sender(topic).subscribe()
    }

    fn advertise(&self, protocol: String) {
        self.shared
            .protocols
            .write()
            .expect("protocols lock poisoned")
            .insert(protocol);
    }

    fn advertised(&self) -> Vec<String> {
        self.shared
            .protocols
            .read()
            .expect("protocols lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}
