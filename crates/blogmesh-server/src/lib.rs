//! The blogmesh relay node.
//!
//! Assembles the replication subsystem around a persistent store: a TCP
//! peer link, a connection watcher feeding discovered logs to the
//! replication tracker, an announcement subscription, and a metrics HTTP
//! endpoint. Shutdown stops new opens, closes every log, flushes the
//! metrics sink and disconnects peers.

pub mod config;
pub mod error;
pub mod handler;
pub mod router;
pub mod server;

pub use config::{PinConfig, RelayConfig, DEFAULT_ANNOUNCE_TOPIC};
pub use error::{ServerError, ServerResult};
pub use server::RelayNode;
