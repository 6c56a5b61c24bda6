//! Peer connectivity for blogmesh.
//!
//! The replication core sees the network only through the [`PeerLink`]
//! capability: dial, list connections, a typed stream of [`PeerEvent`]s,
//! identify, and topic publish/subscribe. Two links are provided:
//!
//! - [`MemorySwarm`] / [`MemoryPeerLink`] -- in-process, with knobs for
//!   unreachable peers and peers that never answer identify. Used by tests.
//! - [`TcpPeerLink`] -- plain TCP with length-prefixed bincode frames.
//!
//! On top of a link sit the [`LogDiscoveryResolver`], which turns a peer's
//! advertised head protocols into [`LogAddress`](blogmesh_types::LogAddress)es,
//! and the [`ConnectionWatcher`], the single receive loop over link events.

pub mod codec;
pub mod error;
pub mod link;
pub mod memory;
pub mod protocol;
pub mod resolver;
pub mod tcp;
pub mod watcher;

pub use codec::{WireCodec, WireMessage};
pub use error::{NetError, NetResult};
pub use link::{IdentifyInfo, PeerEvent, PeerLink, TopicMessage};
pub use memory::{IdentifyMode, MemoryPeerLink, MemorySwarm};
pub use protocol::{head_protocol, parse_head_protocol, HEAD_PROTOCOL_PREFIX};
pub use resolver::LogDiscoveryResolver;
pub use tcp::{TcpConfig, TcpPeerLink};
pub use watcher::{ConnectionWatcher, DiscoverySink};
