use std::sync::Arc;
use std::time::Duration;

use blogmesh_metrics::{Operation, Status, SyncMetrics};
use blogmesh_types::{LogAddress, PeerId};
use tracing::debug;

use crate::error::{NetError, NetResult};
use crate::link::PeerLink;
use crate::protocol::parse_head_protocol;

/// Finds the logs a connected peer advertises.
///
/// Identifies the peer and parses every advertised head protocol back into
/// a [`LogAddress`]. A peer that times out or does not support identify
/// yields an empty list; it may simply not speak the protocol.
pub struct LogDiscoveryResolver {
    link: Arc<dyn PeerLink>,
    metrics: Arc<SyncMetrics>,
    identify_timeout: Duration,
}

impl LogDiscoveryResolver {
    pub fn new(link: Arc<dyn PeerLink>, metrics: Arc<SyncMetrics>, identify_timeout: Duration) -> Self {
        Self {
            link,
            metrics,
            identify_timeout,
        }
    }

    /// Candidate log addresses advertised by `peer`, deduplicated and sorted.
    ///
    /// Errors other than timeout or unsupported identify are returned for
    /// the caller to log.
    pub async fn resolve(&self, peer: &PeerId) -> NetResult<Vec<LogAddress>> {
        let timer = self.metrics.start(Operation::Discover);
        let info = match tokio::time::timeout(self.identify_timeout, self.link.identify(peer)).await {
            Ok(Ok(info)) => info,
            Ok(Err(NetError::UnsupportedProtocol(_))) => {
                debug!(%peer, "peer does not support identify");
                timer.finish(Status::Skipped);
                return Ok(Vec::new());
            }
            Err(_) => {
                debug!(%peer, timeout = ?self.identify_timeout, "identify timed out");
                timer.finish(Status::Skipped);
                return Ok(Vec::new());
            }
            Ok(Err(e)) => {
                timer.finish(Status::Error);
                return Err(e);
            }
        };

        let mut addresses: Vec<LogAddress> = info
            .protocols
            .iter()
            .filter_map(|p| parse_head_protocol(p))
            .collect();
        addresses.sort();
        addresses.dedup();
        debug!(%peer, advertised = info.protocols.len(), logs = addresses.len(), "resolved peer logs");
        timer.finish(Status::Ok);
        Ok(addresses)
    }
}

impl std::fmt::Debug for LogDiscoveryResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogDiscoveryResolver")
            .field("identify_timeout", &self.identify_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{IdentifyMode, MemoryPeerLink, MemorySwarm};
    use crate::protocol::head_protocol;

    fn peer(n: u8) -> PeerId {
        PeerId::from_raw([n; 32])
    }

    async fn pair() -> (MemoryPeerLink, MemoryPeerLink, LogDiscoveryResolver, Arc<SyncMetrics>) {
        let swarm = MemorySwarm::new();
        let a = swarm.join(peer(1));
        let b = swarm.join(peer(2));
        a.dial(&peer(2), &[]).await.unwrap();
        let metrics = Arc::new(SyncMetrics::new());
        let resolver =
            LogDiscoveryResolver::new(Arc::new(a.clone()), metrics.clone(), Duration::from_millis(50));
        (a, b, resolver, metrics)
    }

    #[tokio::test]
    async fn parses_advertised_heads() {
        let (_a, b, resolver, metrics) = pair().await;
        let one = LogAddress::mint("blogmesh", b"one");
        let two = LogAddress::mint("blogmesh", b"two");
        b.advertise(head_protocol(&two));
        b.advertise(head_protocol(&one));
        b.advertise("/ipfs/ping/1.0.0".into());

        let mut expected = vec![one, two];
        expected.sort();
        assert_eq!(resolver.resolve(&peer(2)).await.unwrap(), expected);
        assert_eq!(metrics.counter(Operation::Discover, Status::Ok), 1);
    }

    #[tokio::test]
    async fn unsupported_identify_is_empty() {
        let (_a, b, resolver, metrics) = pair().await;
        b.set_identify_mode(IdentifyMode::Unsupported);
        assert!(resolver.resolve(&peer(2)).await.unwrap().is_empty());
        assert_eq!(metrics.counter(Operation::Discover, Status::Skipped), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn identify_timeout_is_empty() {
        let (_a, b, resolver, metrics) = pair().await;
        b.set_identify_mode(IdentifyMode::Silent);
        assert!(resolver.resolve(&peer(2)).await.unwrap().is_empty());
        assert_eq!(metrics.counter(Operation::Discover, Status::Skipped), 1);
    }

    #[tokio::test]
    async fn other_errors_surface() {
        let (a, _b, resolver, metrics) = pair().await;
        a.disconnect(&peer(2));
        let err = resolver.resolve(&peer(2)).await.unwrap_err();
        assert!(matches!(err, NetError::NotConnected(_)));
        assert_eq!(metrics.counter(Operation::Discover, Status::Error), 1);
    }
}
