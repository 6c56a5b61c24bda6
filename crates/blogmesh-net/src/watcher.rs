use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use blogmesh_metrics::{Operation, Status, SyncMetrics};
use blogmesh_types::{LogAddress, PeerId};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::link::{PeerEvent, PeerLink};
use crate::resolver::LogDiscoveryResolver;

/// Receives the log addresses found on newly connected peers.
#[async_trait]
pub trait DiscoverySink: Send + Sync {
    async fn logs_discovered(&self, peer: &PeerId, addresses: Vec<LogAddress>);
}

/// Single receive loop over a link's [`PeerEvent`]s.
///
/// - `Discovered`: dial the peer unless already connected. Failures are
///   counted and logged; the next discovery retries.
/// - `Connected`: track the peer and resolve its logs into the sink.
/// - `Disconnected`: forget the peer. Logs opened through it stay open.
///
/// Dials and resolutions run as their own tasks so a slow peer never holds
/// up the loop.
pub struct ConnectionWatcher {
    link: Arc<dyn PeerLink>,
    resolver: Arc<LogDiscoveryResolver>,
    sink: Arc<dyn DiscoverySink>,
    metrics: Arc<SyncMetrics>,
    peers: RwLock<HashSet<PeerId>>,
    dial_timeout: Duration,
    tasks: TaskTracker,
}

impl ConnectionWatcher {
    pub fn new(
        link: Arc<dyn PeerLink>,
        resolver: Arc<LogDiscoveryResolver>,
        sink: Arc<dyn DiscoverySink>,
        metrics: Arc<SyncMetrics>,
        dial_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            link,
            resolver,
            sink,
            metrics,
            peers: RwLock::new(HashSet::new()),
            dial_timeout,
            tasks: TaskTracker::new(),
        })
    }

    /// Subscribe to link events and run the loop until `cancel` fires.
    ///
    /// Peers already connected when this is called are treated as new
    /// connections.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let events = self.link.events();
        let watcher = self.clone();
        tokio::spawn(async move { watcher.run(events, cancel).await })
    }

    async fn run(self: Arc<Self>, mut events: broadcast::Receiver<PeerEvent>, cancel: CancellationToken) {
        info!(local = %self.link.local_peer(), "connection watcher started");
        self.catch_up();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => self.handle(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "peer events lagged, resyncing connections");
                        self.catch_up();
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        self.tasks.close();
        debug!("connection watcher stopped");
    }

    fn handle(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::Discovered { peer, addrs } => {
                if peer == self.link.local_peer() || self.link.connections().contains(&peer) {
                    return;
                }
                self.spawn_dial(peer, addrs);
            }
            PeerEvent::Connected { peer } => {
                let new = self.peers.write().expect("peers lock poisoned").insert(peer);
                self.update_gauge();
                if new {
                    self.spawn_discovery(peer);
                }
            }
            PeerEvent::Disconnected { peer } => {
                self.peers.write().expect("peers lock poisoned").remove(&peer);
                self.update_gauge();
                debug!(%peer, "peer left; its logs stay open");
            }
        }
    }

    /// Reconcile the peer set with the link's current connections.
    fn catch_up(self: &Arc<Self>) {
        let current: HashSet<PeerId> = self.link.connections().into_iter().collect();
        let added: Vec<PeerId> = {
            let mut peers = self.peers.write().expect("peers lock poisoned");
            let added = current.difference(&peers).copied().collect();
            *peers = current;
            added
        };
        self.update_gauge();
        for peer in added {
            self.spawn_discovery(peer);
        }
    }

    fn update_gauge(&self) {
        let count = self.peers.read().expect("peers lock poisoned").len();
        self.metrics.set_connected_peers(count);
    }

    fn spawn_dial(&self, peer: PeerId, addrs: Vec<SocketAddr>) {
        let link = self.link.clone();
        let metrics = self.metrics.clone();
        let dial_timeout = self.dial_timeout;
        self.tasks.spawn(async move {
            let timer = metrics.start(Operation::Dial);
            match tokio::time::timeout(dial_timeout, link.dial(&peer, &addrs)).await {
                Ok(Ok(())) => {
                    timer.finish(Status::Ok);
                    debug!(%peer, "dialed discovered peer");
                }
                Ok(Err(e)) => {
                    timer.finish(Status::Error);
                    debug!(%peer, error = %e, transient = e.is_transient(), "dial failed");
                }
                Err(_) => {
                    timer.finish(Status::Error);
                    debug!(%peer, timeout = ?dial_timeout, "dial timed out");
                }
            }
        });
    }

    fn spawn_discovery(&self, peer: PeerId) {
        let resolver = self.resolver.clone();
        let sink = self.sink.clone();
        self.tasks.spawn(async move {
            match resolver.resolve(&peer).await {
                Ok(addresses) if addresses.is_empty() => {
                    debug!(%peer, "peer advertises no logs");
                }
                Ok(addresses) => {
                    debug!(%peer, count = addresses.len(), "discovered logs");
                    sink.logs_discovered(&peer, addresses).await;
                }
                Err(e) => warn!(%peer, error = %e, "log discovery failed"),
            }
        });
    }

    /// Peers currently tracked as connected.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .peers
            .read()
            .expect("peers lock poisoned")
            .iter()
            .copied()
            .collect();
        peers.sort();
        peers
    }
}
