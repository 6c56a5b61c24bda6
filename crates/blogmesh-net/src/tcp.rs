use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use blogmesh_types::PeerId;
use bytes::Bytes;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::codec::{read_message, write_message, WireMessage};
use crate::error::{NetError, NetResult};
use crate::link::{IdentifyInfo, PeerEvent, PeerLink, TopicMessage};

const EVENT_CAPACITY: usize = 1024;
const TOPIC_CAPACITY: usize = 256;

/// Configuration for a [`TcpPeerLink`].
#[derive(Clone, Debug)]
pub struct TcpConfig {
    /// Address to accept connections on. Port 0 picks an ephemeral port.
    pub listen: SocketAddr,
    pub connect_timeout: Duration,
    /// Time allowed for the remote `Hello` after connecting.
    pub handshake_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 0)),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// [`PeerLink`] over plain TCP.
///
/// Every connection starts with a `Hello` exchange carrying the peer id,
/// advertised protocols, listen port and the sender's other connections.
/// Peers learned from a `Hello` are reported as [`PeerEvent::Discovered`]
/// with their listen address, so a watcher can dial them.
#[derive(Clone)]
pub struct TcpPeerLink {
    inner: Arc<Inner>,
}

struct Connection {
    id: u64,
    listen_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<WireMessage>,
}

struct Inner {
    local: PeerId,
    listen_addr: SocketAddr,
    config: TcpConfig,
    events: broadcast::Sender<PeerEvent>,
    connections: RwLock<HashMap<PeerId, Connection>>,
    protocols: RwLock<BTreeSet<String>>,
    topics: RwLock<HashMap<String, broadcast::Sender<TopicMessage>>>,
    pending: Mutex<HashMap<u64, (PeerId, oneshot::Sender<Vec<String>>)>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl TcpPeerLink {
    /// Bind the listener and start accepting connections.
    pub async fn bind(local: PeerId, config: TcpConfig) -> NetResult<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        let listen_addr = listener.local_addr()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            local,
            listen_addr,
            config,
            events,
            connections: RwLock::new(HashMap::new()),
            protocols: RwLock::new(BTreeSet::new()),
            topics: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        inner.tasks.spawn(accept_loop(inner.clone(), listener));
        info!(peer = %local, addr = %listen_addr, "tcp link listening");
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.listen_addr
    }

    /// Connect to whatever peer listens at `addr`, returning its id.
    pub async fn dial_addr(&self, addr: SocketAddr) -> NetResult<PeerId> {
        self.inner.clone().connect(addr, None).await
    }

    /// Close every connection and stop accepting new ones.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner
            .connections
            .write()
            .expect("connections lock poisoned")
            .clear();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        debug!(peer = %self.inner.local, "tcp link shut down");
    }
}

impl std::fmt::Debug for TcpPeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpPeerLink")
            .field("peer", &self.inner.local)
            .field("listen_addr", &self.inner.listen_addr)
            .finish()
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let conn = inner.clone();
                    inner.tasks.spawn(async move {
                        if let Err(e) = conn.establish(stream, addr, None).await {
                            debug!(%addr, error = %e, "inbound handshake failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }
}

impl Inner {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.connections
            .read()
            .expect("connections lock poisoned")
            .contains_key(peer)
    }

    fn hello(&self) -> WireMessage {
        let known_peers = self
            .connections
            .read()
            .expect("connections lock poisoned")
            .iter()
            .map(|(peer, conn)| (*peer, conn.listen_addr))
            .collect();
        WireMessage::Hello {
            peer: self.local,
            protocols: self.advertised(),
            listen_port: self.listen_addr.port(),
            known_peers,
        }
    }

    fn advertised(&self) -> Vec<String> {
        self.protocols
            .read()
            .expect("protocols lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    fn send(&self, peer: &PeerId, msg: WireMessage) -> NetResult<()> {
        let connections = self.connections.read().expect("connections lock poisoned");
        let conn = connections.get(peer).ok_or(NetError::NotConnected(*peer))?;
        conn.outbound
            .send(msg)
            .map_err(|_| NetError::NotConnected(*peer))
    }

    async fn connect(self: Arc<Self>, addr: SocketAddr, expected: Option<PeerId>) -> NetResult<PeerId> {
        if self.cancel.is_cancelled() {
            return Err(NetError::Shutdown);
        }
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetError::ConnectTimeout(addr))??;
        self.establish(stream, addr, expected).await
    }

    /// Exchange `Hello`s on a fresh stream and register the connection.
    async fn establish(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        expected: Option<PeerId>,
    ) -> NetResult<PeerId> {
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();
        write_message(&mut writer, &self.hello()).await?;

        let first = tokio::time::timeout(self.config.handshake_timeout, read_message(&mut reader))
            .await
            .map_err(|_| NetError::Handshake("timed out waiting for hello".into()))??;
        let Some(WireMessage::Hello {
            peer,
            listen_port,
            known_peers,
            ..
        }) = first
        else {
            return Err(NetError::Handshake("expected hello".into()));
        };
        if peer == self.local {
            return Err(NetError::Handshake("connected to self".into()));
        }
        if let Some(expected) = expected {
            if peer != expected {
                return Err(NetError::Handshake(format!("expected {expected}, got {peer}")));
            }
        }

        let (outbound, mut rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut connections = self.connections.write().expect("connections lock poisoned");
            if connections.contains_key(&peer) {
                debug!(%peer, "dropping duplicate connection");
                return Ok(peer);
            }
            connections.insert(
                peer,
                Connection {
                    id,
                    listen_addr: SocketAddr::new(remote_addr.ip(), listen_port),
                    outbound,
                },
            );
        }
        info!(%peer, addr = %remote_addr, "peer connected");
        self.emit(PeerEvent::Connected { peer });

        for (known, addr) in known_peers {
            if known != self.local && !self.is_connected(&known) {
                self.emit(PeerEvent::Discovered {
                    peer: known,
                    addrs: vec![addr],
                });
            }
        }

        self.tasks.spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write_message(&mut writer, &msg).await {
                    debug!(%peer, error = %e, "write failed");
                    break;
                }
            }
        });
        let conn = self.clone();
        self.tasks.spawn(async move {
            conn.read_loop(peer, reader).await;
            conn.remove_connection(&peer, id);
        });
        Ok(peer)
    }

    async fn read_loop(&self, peer: PeerId, mut reader: OwnedReadHalf) {
        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => return,
                msg = read_message(&mut reader) => msg,
            };
            match msg {
                Ok(Some(WireMessage::IdentifyRequest { id })) => {
                    let reply = WireMessage::IdentifyResponse {
                        id,
                        protocols: self.advertised(),
                    };
                    if self.send(&peer, reply).is_err() {
                        return;
                    }
                }
                Ok(Some(WireMessage::IdentifyResponse { id, protocols })) => {
                    let waiter = self.pending.lock().expect("pending lock poisoned").remove(&id);
                    if let Some((_, tx)) = waiter {
                        let _ = tx.send(protocols);
                    }
                }
                Ok(Some(WireMessage::Publish { topic, data })) => {
                    let sender = self
                        .topics
                        .read()
                        .expect("topics lock poisoned")
                        .get(&topic)
                        .cloned();
                    if let Some(sender) = sender {
                        let _ = sender.send(TopicMessage {
                            from: peer,
                            topic,
                            data: Bytes::from(data),
                        });
                    }
                }
                Ok(Some(WireMessage::Hello { .. })) => {
                    debug!(%peer, "ignoring repeated hello");
                }
                Ok(None) => return,
                Err(e) => {
                    debug!(%peer, error = %e, "connection read failed");
                    return;
                }
            }
        }
    }

    fn remove_connection(&self, peer: &PeerId, id: u64) {
        let removed = {
            let mut connections = self.connections.write().expect("connections lock poisoned");
            match connections.get(peer) {
                Some(conn) if conn.id == id => connections.remove(peer).is_some(),
                _ => false,
            }
        };
        // Waiters on this peer fail with NotConnected.
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .retain(|_, (p, _)| p != peer);
        if removed {
            info!(%peer, "peer disconnected");
            self.emit(PeerEvent::Disconnected { peer: *peer });
        }
    }
}

#[async_trait]
impl PeerLink for TcpPeerLink {
    fn local_peer(&self) -> PeerId {
        self.inner.local
    }

    fn events(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    async fn dial(&self, peer: &PeerId, addrs: &[SocketAddr]) -> NetResult<()> {
        if self.inner.is_connected(peer) {
            return Ok(());
        }
        let mut reason = String::from("no known addresses");
        for addr in addrs {
            match self.inner.clone().connect(*addr, Some(*peer)).await {
                Ok(_) => return Ok(()),
                Err(e) => reason = e.to_string(),
            }
        }
        Err(NetError::DialFailed {
            peer: *peer,
            reason,
        })
    }

    fn connections(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .inner
            .connections
            .read()
            .expect("connections lock poisoned")
            .keys()
            .copied()
            .collect();
        peers.sort();
        peers
    }

    async fn identify(&self, peer: &PeerId) -> NetResult<IdentifyInfo> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, (*peer, tx));
        if let Err(e) = self.inner.send(peer, WireMessage::IdentifyRequest { id }) {
            self.inner.pending.lock().expect("pending lock poisoned").remove(&id);
            return Err(e);
        }
        let protocols = rx.await.map_err(|_| NetError::NotConnected(*peer))?;
        Ok(IdentifyInfo {
            peer: *peer,
            protocols,
        })
    }

    async fn publish(&self, topic: &str, data: Bytes) -> NetResult<()> {
        for peer in self.connections() {
            let msg = WireMessage::Publish {
                topic: topic.to_owned(),
                data: data.to_vec(),
            };
            if let Err(e) = self.inner.send(&peer, msg) {
                debug!(%peer, %topic, error = %e, "publish skipped peer");
            }
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<TopicMessage> {
        self.inner
            .topics
            .write()
            .expect("topics lock poisoned")
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    fn advertise(&self, protocol: String) {
        self.inner
            .protocols
            .write()
            .expect("protocols lock poisoned")
            .insert(protocol);
    }

    fn advertised(&self) -> Vec<String> {
        self.inner.advertised()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TcpConfig {
        TcpConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            ..TcpConfig::default()
        }
    }

    async fn link(n: u8) -> TcpPeerLink {
        TcpPeerLink::bind(PeerId::from_raw([n; 32]), config()).await.unwrap()
    }

    async fn next_event(rx: &mut broadcast::Receiver<PeerEvent>) -> PeerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timed out")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn connect_identify_and_publish() {
        let a = link(1).await;
        let b = link(2).await;
        b.advertise("/blogmesh/heads/blogmesh/abc".into());
        let mut a_events = a.events();
        let mut b_events = b.events();
        let mut b_topic = b.subscribe("news");

        let peer = a.dial_addr(b.local_addr()).await.unwrap();
        assert_eq!(peer, b.local_peer());
        assert_eq!(next_event(&mut a_events).await, PeerEvent::Connected { peer });
        assert_eq!(
            next_event(&mut b_events).await,
            PeerEvent::Connected { peer: a.local_peer() }
        );

        let info = a.identify(&peer).await.unwrap();
        assert_eq!(info.protocols, vec!["/blogmesh/heads/blogmesh/abc".to_string()]);

        a.publish("news", Bytes::from_static(b"hello")).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(5), b_topic.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.from, a.local_peer());
        assert_eq!(msg.data, Bytes::from_static(b"hello"));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn hello_reports_known_peers() {
        let a = link(1).await;
        let hub = link(2).await;
        let c = link(3).await;
        let mut hub_events = hub.events();
        a.dial_addr(hub.local_addr()).await.unwrap();
        assert_eq!(
            next_event(&mut hub_events).await,
            PeerEvent::Connected { peer: a.local_peer() }
        );
        let mut c_events = c.events();

        c.dial_addr(hub.local_addr()).await.unwrap();
        let mut discovered = None;
        for _ in 0..3 {
            if let PeerEvent::Discovered { peer, addrs } = next_event(&mut c_events).await {
                discovered = Some((peer, addrs));
                break;
            }
        }
        let (peer, addrs) = discovered.expect("no discovery event");
        assert_eq!(peer, a.local_peer());
        assert_eq!(addrs, vec![a.local_addr()]);

        c.dial(&peer, &addrs).await.unwrap();
        assert!(c.connections().contains(&a.local_peer()));

        for l in [a, hub, c] {
            l.shutdown().await;
        }
    }

    #[tokio::test]
    async fn dial_checks_peer_identity() {
        let a = link(1).await;
        let b = link(2).await;
        let wrong = PeerId::from_raw([9; 32]);
        let err = a.dial(&wrong, &[b.local_addr()]).await.unwrap_err();
        assert!(matches!(err, NetError::DialFailed { .. }));
        assert!(err.is_transient());
        assert!(a.dial(&wrong, &[]).await.is_err());
        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_disconnects_remote() {
        let a = link(1).await;
        let b = link(2).await;
        let mut a_events = a.events();
        let peer = a.dial_addr(b.local_addr()).await.unwrap();
        assert_eq!(next_event(&mut a_events).await, PeerEvent::Connected { peer });

        b.shutdown().await;
        assert_eq!(next_event(&mut a_events).await, PeerEvent::Disconnected { peer });
        assert!(a.connections().is_empty());
        assert!(matches!(
            a.identify(&peer).await,
            Err(NetError::NotConnected(_))
        ));
        a.shutdown().await;
    }
}
