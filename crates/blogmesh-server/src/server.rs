use std::net::SocketAddr;
use std::sync::Arc;

use blogmesh_metrics::{FileSink, SyncMetrics};
use blogmesh_net::{ConnectionWatcher, LogDiscoveryResolver, PeerLink, TcpConfig, TcpPeerLink};
use blogmesh_store::{DataDir, MemoryNetwork, MemoryNode};
use blogmesh_sync::{ContentPinner, ReplicationTracker};
use blogmesh_types::PeerId;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::{ServerError, ServerResult};
use crate::router::build_router;

/// A running relay.
///
/// Accepts peers over TCP, mirrors every log they advertise or announce,
/// pins the blobs those logs reference and serves metrics over HTTP.
pub struct RelayNode {
    config: RelayConfig,
    node: MemoryNode,
    link: TcpPeerLink,
    metrics: Arc<SyncMetrics>,
    tracker: Arc<ReplicationTracker>,
    watcher: JoinHandle<()>,
    metrics_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl RelayNode {
    /// Start a relay on a fresh store network.
    pub async fn start(config: RelayConfig) -> ServerResult<Self> {
        Self::start_on(config, &MemoryNetwork::new()).await
    }

    /// Start a relay whose store joins `network`.
    ///
    /// Fails if the data directory is unusable or a listener cannot bind.
    /// Both listeners are bound before any task starts, so a failed start
    /// leaves nothing running.
    pub async fn start_on(config: RelayConfig, network: &MemoryNetwork) -> ServerResult<Self> {
        config.validate()?;
        let data_dir = DataDir::open(&config.data_dir)?;
        let node = network.join_persistent(data_dir)?;
        let metrics = Arc::new(SyncMetrics::new());

        let metrics_listener = match config.metrics_addr() {
            Some(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|source| ServerError::Bind { addr, source })?;
                Some((listener.local_addr()?, listener))
            }
            None => {
                debug!("metrics endpoint disabled");
                None
            }
        };

        let link = TcpPeerLink::bind(
            node.peer_id(),
            TcpConfig {
                listen: config.tcp_addr(),
                connect_timeout: config.dial_timeout(),
                handshake_timeout: config.identify_timeout(),
            },
        )
        .await?;
        let peer_link: Arc<dyn PeerLink> = Arc::new(link.clone());

        let pinner = ContentPinner::new(Arc::new(node.clone()), metrics.clone(), config.retry_policy());
        let tracker = ReplicationTracker::new(
            Arc::new(node.clone()),
            pinner,
            metrics.clone(),
            Some(peer_link.clone()),
        );
        let persisted = node.log_addresses();
        if !persisted.is_empty() {
            info!(logs = persisted.len(), "resuming persisted logs");
        }
        for address in persisted {
            tracker.spawn_open(address, None);
        }

        let resolver = Arc::new(LogDiscoveryResolver::new(
            peer_link.clone(),
            metrics.clone(),
            config.identify_timeout(),
        ));
        let cancel = CancellationToken::new();
        let watcher = ConnectionWatcher::new(
            peer_link.clone(),
            resolver,
            tracker.clone(),
            metrics.clone(),
            config.dial_timeout(),
        )
        .spawn(cancel.clone());
        tracker.follow_announcements(peer_link.subscribe(&config.announce_topic));

        let tasks = TaskTracker::new();
        for addr in config.bootstrap.iter().copied() {
            let link = link.clone();
            let dial_timeout = config.dial_timeout();
            tasks.spawn(async move {
                match tokio::time::timeout(dial_timeout, link.dial_addr(addr)).await {
                    Ok(Ok(peer)) => info!(%addr, %peer, "connected to bootstrap peer"),
                    Ok(Err(e)) => warn!(%addr, error = %e, "bootstrap dial failed"),
                    Err(_) => warn!(%addr, "bootstrap dial timed out"),
                }
            });
        }

        let metrics_addr = metrics_listener.map(|(addr, listener)| {
            serve_metrics(listener, metrics.clone(), &tasks, cancel.clone());
            addr
        });

        info!(
            peer = %node.peer_id(),
            tcp = %link.local_addr(),
            metrics = ?metrics_addr,
            data_dir = %config.data_dir.display(),
            "relay started"
        );
        Ok(Self {
            config,
            node,
            link,
            metrics,
            tracker,
            watcher,
            metrics_addr,
            cancel,
            tasks,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.node.peer_id()
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.link.local_addr()
    }

    /// Bound metrics address, if the endpoint is enabled.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    pub fn tracker(&self) -> &Arc<ReplicationTracker> {
        &self.tracker
    }

    pub fn store(&self) -> &MemoryNode {
        &self.node
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Run until `signal` resolves, then shut down.
    pub async fn run_until<F>(self, signal: F) -> ServerResult<()>
    where
        F: std::future::Future<Output = ()>,
    {
        signal.await;
        self.shutdown().await
    }

    /// Stop accepting opens, close every log, flush metrics, disconnect.
    pub async fn shutdown(self) -> ServerResult<()> {
        info!("relay shutting down");
        self.tracker.shutdown().await;
        self.cancel.cancel();
        if let Err(e) = self.watcher.await {
            warn!(error = %e, "connection watcher ended abnormally");
        }
        self.tasks.close();
        self.tasks.wait().await;

        let flushed = match &self.config.metrics_dump_path {
            Some(path) => {
                let sink = FileSink::new(path);
                self.metrics.flush_to(&sink).map(|()| debug!(path = %path.display(), "metrics flushed"))
            }
            None => Ok(()),
        };
        self.link.shutdown().await;
        flushed?;
        info!("relay stopped");
        Ok(())
    }
}

impl std::fmt::Debug for RelayNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayNode")
            .field("peer", &self.node.peer_id())
            .field("tcp", &self.link.local_addr())
            .field("metrics", &self.metrics_addr)
            .finish()
    }
}

fn serve_metrics(
    listener: TcpListener,
    metrics: Arc<SyncMetrics>,
    tasks: &TaskTracker,
    cancel: CancellationToken,
) {
    let app = build_router(metrics);
    tasks.spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await;
        if let Err(e) = served {
            error!(error = %e, "metrics server failed");
        }
    });
    debug!("metrics endpoint serving");
}
