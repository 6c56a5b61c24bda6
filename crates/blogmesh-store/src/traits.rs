use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use blogmesh_types::{Cid, LogAddress, LogRecord, PeerId};
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::StoreResult;

/// Change notification emitted by an open log.
#[derive(Clone, Debug, PartialEq)]
pub enum LogEvent {
    /// A peer joined replication of this log.
    Joined { peer: PeerId },
    /// New records were appended (locally or by replication).
    Updated { entries: Vec<LogRecord> },
}

/// An open, replicated log.
///
/// All implementations must satisfy these invariants:
/// - `all()` returns a causally consistent snapshot; it may be stale relative
///   to the latest write but never reflects a write without its causes.
/// - `all()` is idempotent and safe to call concurrently.
/// - Events may be delivered in any order and may be dropped for slow
///   subscribers (reported as `Lagged` by the receiver).
#[async_trait]
pub trait LogHandle: Send + Sync {
    fn address(&self) -> &LogAddress;

    /// Manifest name the log was created with.
    fn name(&self) -> &str;

    /// Append a `PUT` record authored by this node's identity.
    async fn put(&self, key: &str, value: Value) -> StoreResult<LogRecord>;

    /// Append a `DEL` record authored by this node's identity.
    async fn del(&self, key: &str) -> StoreResult<LogRecord>;

    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Materialized key -> value view.
    async fn all(&self) -> StoreResult<BTreeMap<String, Value>>;

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<LogEvent>;

    /// Stop replicating. Further writes fail with `Closed`.
    async fn close(&self) -> StoreResult<()>;
}

/// Access to append-only logs by address.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Open a log by address, joining its replication.
    ///
    /// Opening an address twice yields the same logical handle. Fails with a
    /// transient error when no reachable node provides the manifest yet.
    async fn open(&self, address: &LogAddress) -> StoreResult<Arc<dyn LogHandle>>;

    /// Create a new log owned by this node and return its handle.
    async fn create(&self, name: &str) -> StoreResult<Arc<dyn LogHandle>>;
}

/// Content-addressed blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes locally and return their identifier.
    async fn add(&self, data: Bytes) -> StoreResult<Cid>;

    /// Fetch bytes by identifier, from the local store or the network.
    async fn fetch(&self, cid: &Cid) -> StoreResult<Bytes>;

    /// Whether [`BlobStore::pin`] retains anything.
    fn supports_pin(&self) -> bool {
        false
    }

    /// Retain a locally held blob regardless of cache pressure.
    async fn pin(&self, cid: &Cid) -> StoreResult<()> {
        let _ = cid;
        Ok(())
    }
}
