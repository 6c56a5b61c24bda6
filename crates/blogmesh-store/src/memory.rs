use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use blogmesh_crypto::{sign_record, verify_record, Identity, KeypairIdentity};
use blogmesh_types::address::DEFAULT_NAMESPACE;
use blogmesh_types::{Cid, LogAddress, LogRecord, Op, PeerId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::fs::DataDir;
use crate::merge::materialize;
use crate::traits::{BlobStore, LogEvent, LogHandle, LogStore};

const EVENT_CAPACITY: usize = 256;
const LOG_KEY_PREFIX: &str = "log/";
const RECORD_KEY_PREFIX: &str = "rec/";
const PINS_KEY: &str = "pins";

/// In-process network of nodes.
///
/// Every [`MemoryNode`] joined to the same network can open the logs and
/// fetch the blobs of every other *online* node. Writes to a log propagate
/// to all online nodes holding a replica of it; a node that goes offline
/// keeps its replicas and catches up when it comes back.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<RwLock<Vec<Arc<NodeInner>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a node with a fresh identity.
    pub fn join(&self) -> MemoryNode {
        self.join_with(Arc::new(KeypairIdentity::generate()))
    }

    /// Join a node authoring records with `identity`.
    pub fn join_with(&self, identity: Arc<KeypairIdentity>) -> MemoryNode {
        self.attach(NodeInner::new(identity, None))
    }

    /// Join a node whose logs, blobs and pins persist in `data_dir`.
    ///
    /// The node identity is loaded from (or created in) the datastore and
    /// previously replicated logs are reloaded. Records failing signature
    /// verification are dropped.
    pub fn join_persistent(&self, data_dir: DataDir) -> StoreResult<MemoryNode> {
        let identity = Arc::new(data_dir.load_or_create_identity()?);
        let inner = NodeInner::new(identity, Some(data_dir));
        inner.load_persisted()?;
        Ok(self.attach(inner))
    }

    fn attach(&self, inner: NodeInner) -> MemoryNode {
        let inner = Arc::new(inner);
        self.nodes
            .write()
            .expect("network lock poisoned")
            .push(inner.clone());
        MemoryNode {
            inner,
            network: self.clone(),
        }
    }

    /// Online nodes other than `me`.
    fn online_peers(&self, me: &PeerId) -> Vec<Arc<NodeInner>> {
        self.nodes
            .read()
            .expect("network lock poisoned")
            .iter()
            .filter(|n| n.peer != *me && n.online.load(Ordering::SeqCst))
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.nodes.read().expect("network lock poisoned").len();
        f.debug_struct("MemoryNetwork").field("nodes", &count).finish()
    }
}

/// Log metadata, written once when a replica is created.
#[derive(Serialize, Deserialize)]
struct LogMeta {
    name: String,
}

/// Datastore key of one record: `rec/<address>/<entry id>`.
fn record_key(address: &LogAddress, record: &LogRecord) -> String {
    format!("{RECORD_KEY_PREFIX}{address}/{}", hex::encode(record.entry_id()))
}

/// Address part of a record key.
fn record_address(key: &str) -> Option<LogAddress> {
    let (address, _) = key.strip_prefix(RECORD_KEY_PREFIX)?.rsplit_once('/')?;
    LogAddress::parse(address).ok()
}

/// One node's replica of a log.
struct Replica {
    address: LogAddress,
    name: String,
    state: RwLock<ReplicaState>,
    events: broadcast::Sender<LogEvent>,
    closed: AtomicBool,
}

#[derive(Default)]
struct ReplicaState {
    records: Vec<LogRecord>,
    seen: HashSet<[u8; 32]>,
}

impl Replica {
    fn new(address: LogAddress, name: String) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            address,
            name,
            state: RwLock::new(ReplicaState::default()),
            events,
            closed: AtomicBool::new(false),
        }
    }

    /// Add records not yet present. Returns the ones that were new.
    fn merge(&self, records: &[LogRecord]) -> Vec<LogRecord> {
        let mut state = self.state.write().expect("replica lock poisoned");
        let mut added = Vec::new();
        for record in records {
            if state.seen.insert(record.entry_id()) {
                state.records.push(record.clone());
                added.push(record.clone());
            }
        }
        added
    }

    fn records(&self) -> Vec<LogRecord> {
        self.state.read().expect("replica lock poisoned").records.clone()
    }

    fn max_clock(&self) -> u64 {
        self.state
            .read()
            .expect("replica lock poisoned")
            .records
            .iter()
            .map(|r| r.clock)
            .max()
            .unwrap_or(0)
    }

    fn notify(&self, event: LogEvent) {
        // No receivers is fine: nobody is watching this log yet.
        let _ = self.events.send(event);
    }
}

struct NodeInner {
    peer: PeerId,
    identity: Arc<KeypairIdentity>,
    online: AtomicBool,
    clock: AtomicU64,
    logs: RwLock<HashMap<LogAddress, Arc<Replica>>>,
    blobs: RwLock<HashMap<Cid, Bytes>>,
    pins: RwLock<HashSet<Cid>>,
    fetch_attempts: RwLock<HashMap<Cid, u32>>,
    data_dir: Option<DataDir>,
}

impl NodeInner {
    fn new(identity: Arc<KeypairIdentity>, data_dir: Option<DataDir>) -> Self {
        Self {
            peer: identity.peer_id(),
            identity,
            online: AtomicBool::new(true),
            clock: AtomicU64::new(0),
            logs: RwLock::new(HashMap::new()),
            blobs: RwLock::new(HashMap::new()),
            pins: RwLock::new(HashSet::new()),
            fetch_attempts: RwLock::new(HashMap::new()),
            data_dir,
        }
    }

    fn replica(&self, address: &LogAddress) -> Option<Arc<Replica>> {
        self.logs
            .read()
            .expect("node lock poisoned")
            .get(address)
            .cloned()
    }

    /// Insert a replica unless one already exists; return the winner.
    fn insert_replica(&self, replica: Replica) -> Arc<Replica> {
        let mut logs = self.logs.write().expect("node lock poisoned");
        logs.entry(replica.address.clone())
            .or_insert_with(|| Arc::new(replica))
            .clone()
    }

    fn observe_clock(&self, records: &[LogRecord]) {
        if let Some(max) = records.iter().map(|r| r.clock).max() {
            self.clock.fetch_max(max, Ordering::SeqCst);
        }
    }

    /// Merge records into a replica, persist, and notify subscribers.
    fn absorb(&self, replica: &Replica, records: &[LogRecord]) -> usize {
        let added = replica.merge(records);
        if added.is_empty() {
            return 0;
        }
        self.observe_clock(&added);
        self.persist_records(&replica.address, &added);
        let count = added.len();
        replica.notify(LogEvent::Updated { entries: added });
        count
    }

    fn local_blob(&self, cid: &Cid) -> Option<Bytes> {
        if let Some(data) = self.blobs.read().expect("node lock poisoned").get(cid) {
            return Some(data.clone());
        }
        let dir = self.data_dir.as_ref()?;
        match dir.blockstore().get(cid) {
            Ok(data) => data,
            Err(e) => {
                warn!(%cid, error = %e, "blockstore read failed");
                None
            }
        }
    }

    fn persist_meta(&self, replica: &Replica) {
        let Some(dir) = &self.data_dir else { return };
        let key = format!("{LOG_KEY_PREFIX}{}", replica.address);
        let meta = LogMeta {
            name: replica.name.clone(),
        };
        if let Err(e) = dir.datastore().put(&key, &meta) {
            warn!(address = %replica.address, error = %e, "failed to persist log");
        }
    }

    /// Write each new record under its own key; existing records are untouched.
    fn persist_records(&self, address: &LogAddress, records: &[LogRecord]) {
        let Some(dir) = &self.data_dir else { return };
        for record in records {
            if let Err(e) = dir.datastore().put(&record_key(address, record), record) {
                warn!(%address, key = %record.key, error = %e, "failed to persist record");
            }
        }
    }

    fn persist_pins(&self) -> StoreResult<()> {
        let Some(dir) = &self.data_dir else { return Ok(()) };
        let mut pins: Vec<Cid> = self
            .pins
            .read()
            .expect("node lock poisoned")
            .iter()
            .copied()
            .collect();
        pins.sort();
        dir.datastore().put(PINS_KEY, &pins)
    }

    fn load_persisted(&self) -> StoreResult<()> {
        let Some(dir) = &self.data_dir else { return Ok(()) };
        let ds = dir.datastore();

        let mut records: HashMap<LogAddress, Vec<LogRecord>> = HashMap::new();
        for (key, record) in ds.load_prefix::<LogRecord>(RECORD_KEY_PREFIX)? {
            let Some(address) = record_address(&key) else {
                warn!(%key, "deleting record with malformed key");
                ds.delete(&key)?;
                continue;
            };
            if let Err(e) = verify_record(&record) {
                warn!(%address, %key, error = %e, "deleting record with bad signature");
                ds.delete(&key)?;
                continue;
            }
            records.entry(address).or_default().push(record);
        }

        for (key, meta) in ds.load_prefix::<LogMeta>(LOG_KEY_PREFIX)? {
            let Ok(address) = LogAddress::parse(&key[LOG_KEY_PREFIX.len()..]) else {
                warn!(%key, "deleting log entry with malformed address");
                ds.delete(&key)?;
                continue;
            };
            let valid = records.remove(&address).unwrap_or_default();
            let replica = Replica::new(address, meta.name);
            replica.merge(&valid);
            self.observe_clock(&valid);
            self.insert_replica(replica);
        }
        if !records.is_empty() {
            warn!(logs = records.len(), "ignoring records of logs with no metadata");
        }

        match ds.get::<Vec<Cid>>(PINS_KEY) {
            Ok(pins) => {
                let pins: Vec<Cid> = pins
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|cid| dir.blockstore().has(cid))
                    .collect();
                self.pins.write().expect("node lock poisoned").extend(pins);
            }
            Err(StoreError::CorruptEntry { key, reason }) => {
                warn!(%key, %reason, "deleting corrupt pin list");
                ds.delete(&key)?;
            }
            Err(e) => return Err(e),
        }

        let logs = self.logs.read().expect("node lock poisoned").len();
        info!(peer = %self.peer, logs, "loaded persisted state");
        Ok(())
    }
}

/// A node of a [`MemoryNetwork`]. Implements [`LogStore`] and [`BlobStore`].
#[derive(Clone)]
pub struct MemoryNode {
    inner: Arc<NodeInner>,
    network: MemoryNetwork,
}

impl MemoryNode {
    pub fn peer_id(&self) -> PeerId {
        self.inner.peer
    }

    pub fn identity(&self) -> Arc<KeypairIdentity> {
        self.inner.identity.clone()
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Take the node off the network or bring it back.
    ///
    /// Coming back online exchanges records with every online node holding
    /// the same logs, in both directions.
    pub fn set_online(&self, online: bool) {
        let was = self.inner.online.swap(online, Ordering::SeqCst);
        if online && !was {
            self.resync_all();
        }
        debug!(peer = %self.inner.peer, online, "node connectivity changed");
    }

    /// Addresses of every log this node holds a replica of.
    pub fn log_addresses(&self) -> Vec<LogAddress> {
        let mut out: Vec<LogAddress> = self
            .inner
            .logs
            .read()
            .expect("node lock poisoned")
            .keys()
            .cloned()
            .collect();
        out.sort();
        out
    }

    pub fn has_blob(&self, cid: &Cid) -> bool {
        self.inner.local_blob(cid).is_some()
    }

    pub fn is_pinned(&self, cid: &Cid) -> bool {
        self.inner.pins.read().expect("node lock poisoned").contains(cid)
    }

    /// Number of `fetch` calls made for `cid` on this node.
    pub fn fetch_attempts(&self, cid: &Cid) -> u32 {
        self.inner
            .fetch_attempts
            .read()
            .expect("node lock poisoned")
            .get(cid)
            .copied()
            .unwrap_or(0)
    }

    fn handle(&self, replica: Arc<Replica>) -> Arc<dyn LogHandle> {
        Arc::new(MemoryLog {
            replica,
            node: self.clone(),
        })
    }

    /// Exchange records for one replica with every online holder.
    fn sync_replica(&self, replica: &Arc<Replica>) {
        for peer in self.network.online_peers(&self.inner.peer) {
            let Some(remote) = peer.replica(&replica.address) else {
                continue;
            };
            if remote.closed.load(Ordering::SeqCst) {
                continue;
            }
            let pulled = self.inner.absorb(replica, &remote.records());
            let pushed = peer.absorb(&remote, &replica.records());
            replica.notify(LogEvent::Joined { peer: peer.peer });
            remote.notify(LogEvent::Joined {
                peer: self.inner.peer,
            });
            debug!(address = %replica.address, from = %peer.peer, pulled, pushed, "synced replica");
        }
    }

    fn resync_all(&self) {
        let replicas: Vec<Arc<Replica>> = self
            .inner
            .logs
            .read()
            .expect("node lock poisoned")
            .values()
            .cloned()
            .collect();
        for replica in replicas {
            if !replica.closed.load(Ordering::SeqCst) {
                self.sync_replica(&replica);
            }
        }
    }

    /// Push freshly written records to online holders.
    fn propagate(&self, replica: &Replica, records: &[LogRecord]) {
        if !self.is_online() {
            return;
        }
        for peer in self.network.online_peers(&self.inner.peer) {
            if let Some(remote) = peer.replica(&replica.address) {
                if !remote.closed.load(Ordering::SeqCst) {
                    peer.absorb(&remote, records);
                }
            }
        }
    }

    fn write(
        &self,
        replica: &Arc<Replica>,
        key: &str,
        value: Value,
        op: Op,
    ) -> StoreResult<LogRecord> {
        if replica.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed(replica.address.clone()));
        }
        let base = replica.max_clock();
        let prev = self
            .inner
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.max(base) + 1))
            .unwrap_or_else(|c| c);
        let clock = prev.max(base) + 1;
        let record = sign_record(self.inner.identity.as_ref(), key, value, op, clock);
        self.inner.absorb(replica, std::slice::from_ref(&record));
        self.propagate(replica, std::slice::from_ref(&record));
        Ok(record)
    }
}

impl std::fmt::Debug for MemoryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNode")
            .field("peer", &self.inner.peer)
            .field("online", &self.is_online())
            .finish()
    }
}

#[async_trait]
impl LogStore for MemoryNode {
    async fn open(&self, address: &LogAddress) -> StoreResult<Arc<dyn LogHandle>> {
        if let Some(replica) = self.inner.replica(address) {
            replica.closed.store(false, Ordering::SeqCst);
            if self.is_online() {
                self.sync_replica(&replica);
            }
            return Ok(self.handle(replica));
        }
        if !self.is_online() {
            return Err(StoreError::Unreachable(address.clone()));
        }
        let provider = self
            .network
            .online_peers(&self.inner.peer)
            .into_iter()
            .find_map(|peer| peer.replica(address))
            .ok_or_else(|| StoreError::Unreachable(address.clone()))?;

        let replica = self
            .inner
            .insert_replica(Replica::new(address.clone(), provider.name.clone()));
        self.inner.persist_meta(&replica);
        self.sync_replica(&replica);
        info!(peer = %self.inner.peer, %address, name = %replica.name, "opened remote log");
        Ok(self.handle(replica))
    }

    async fn create(&self, name: &str) -> StoreResult<Arc<dyn LogHandle>> {
        let manifest = serde_json::json!({
            "name": name,
            "owner": self.inner.identity.public_key(),
            "nonce": rand::random::<u64>(),
        });
        let bytes =
            serde_json::to_vec(&manifest).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let address = LogAddress::mint(DEFAULT_NAMESPACE, &bytes);
        let replica = self
            .inner
            .insert_replica(Replica::new(address.clone(), name.to_owned()));
        self.inner.persist_meta(&replica);
        info!(peer = %self.inner.peer, %address, %name, "created log");
        Ok(self.handle(replica))
    }
}

#[async_trait]
impl BlobStore for MemoryNode {
    async fn add(&self, data: Bytes) -> StoreResult<Cid> {
        let cid = Cid::for_bytes(&data);
        if let Some(dir) = &self.inner.data_dir {
            dir.blockstore().put(&data)?;
        }
        self.inner
            .blobs
            .write()
            .expect("node lock poisoned")
            .insert(cid, data);
        Ok(cid)
    }

    async fn fetch(&self, cid: &Cid) -> StoreResult<Bytes> {
        *self
            .inner
            .fetch_attempts
            .write()
            .expect("node lock poisoned")
            .entry(*cid)
            .or_insert(0) += 1;

        if let Some(data) = self.inner.local_blob(cid) {
            return Ok(data);
        }
        if !self.is_online() {
            return Err(StoreError::BlobUnavailable(*cid));
        }
        for peer in self.network.online_peers(&self.inner.peer) {
            let Some(data) = peer.local_blob(cid) else {
                continue;
            };
            if !cid.verify(&data) {
                warn!(%cid, from = %peer.peer, "provider returned mismatched bytes");
                continue;
            }
            self.inner
                .blobs
                .write()
                .expect("node lock poisoned")
                .insert(*cid, data.clone());
            debug!(%cid, from = %peer.peer, size = data.len(), "fetched blob");
            return Ok(data);
        }
        Err(StoreError::BlobUnavailable(*cid))
    }

    fn supports_pin(&self) -> bool {
        true
    }

    async fn pin(&self, cid: &Cid) -> StoreResult<()> {
        let data = self
            .inner
            .local_blob(cid)
            .ok_or(StoreError::NotFound(*cid))?;
        if let Some(dir) = &self.inner.data_dir {
            dir.blockstore().put(&data)?;
        }
        self.inner.pins.write().expect("node lock poisoned").insert(*cid);
        self.inner.persist_pins()
    }
}

/// Handle to a [`MemoryNode`]'s replica of a log.
pub struct MemoryLog {
    replica: Arc<Replica>,
    node: MemoryNode,
}

#[async_trait]
impl LogHandle for MemoryLog {
    fn address(&self) -> &LogAddress {
        &self.replica.address
    }

    fn name(&self) -> &str {
        &self.replica.name
    }

    async fn put(&self, key: &str, value: Value) -> StoreResult<LogRecord> {
        self.node.write(&self.replica, key, value, Op::Put)
    }

    async fn del(&self, key: &str) -> StoreResult<LogRecord> {
        self.node.write(&self.replica, key, Value::Null, Op::Del)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(materialize(&self.replica.records()).remove(key))
    }

    async fn all(&self) -> StoreResult<BTreeMap<String, Value>> {
        Ok(materialize(&self.replica.records()))
    }

    fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.replica.events.subscribe()
    }

    async fn close(&self) -> StoreResult<()> {
        self.replica.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLog")
            .field("address", &self.replica.address)
            .field("name", &self.replica.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_put_and_materialize() {
        let net = MemoryNetwork::new();
        let node = net.join();
        let log = node.create("settings").await.unwrap();
        log.put("blogName", json!("B")).await.unwrap();
        log.put("blogName", json!("B2")).await.unwrap();
        log.put("tmp", json!(1)).await.unwrap();
        log.del("tmp").await.unwrap();

        let view = log.all().await.unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(view["blogName"], json!("B2"));
        assert_eq!(log.get("blogName").await.unwrap(), Some(json!("B2")));
        assert_eq!(log.name(), "settings");
    }

    #[tokio::test]
    async fn open_remote_copies_records() {
        let net = MemoryNetwork::new();
        let publisher = net.join();
        let reader = net.join();
        let log = publisher.create("posts").await.unwrap();
        log.put("p1", json!({"title": "T"})).await.unwrap();

        let remote = reader.open(log.address()).await.unwrap();
        assert_eq!(remote.name(), "posts");
        assert_eq!(remote.all().await.unwrap()["p1"]["title"], json!("T"));
    }

    #[tokio::test]
    async fn open_unknown_address_is_unreachable() {
        let net = MemoryNetwork::new();
        let node = net.join();
        let addr = LogAddress::parse("/log/missing").unwrap();
        let err = node.open(&addr).await.err().unwrap();
        assert!(matches!(err, StoreError::Unreachable(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn writes_propagate_to_online_replicas() {
        let net = MemoryNetwork::new();
        let a = net.join();
        let b = net.join();
        let log = a.create("posts").await.unwrap();
        let replica = b.open(log.address()).await.unwrap();
        let mut events = replica.subscribe();

        log.put("p1", json!({"title": "T"})).await.unwrap();
        match events.recv().await.unwrap() {
            LogEvent::Updated { entries } => assert_eq!(entries[0].key, "p1"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(replica.get("p1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn offline_node_catches_up_on_reconnect() {
        let net = MemoryNetwork::new();
        let a = net.join();
        let b = net.join();
        let log = a.create("posts").await.unwrap();
        let replica = b.open(log.address()).await.unwrap();

        b.set_online(false);
        log.put("p1", json!(1)).await.unwrap();
        assert!(replica.get("p1").await.unwrap().is_none());

        b.set_online(true);
        assert_eq!(replica.get("p1").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let net = MemoryNetwork::new();
        let a = net.join();
        let b = net.join();
        let log = a.create("media").await.unwrap();
        let h1 = b.open(log.address()).await.unwrap();
        let h2 = b.open(log.address()).await.unwrap();
        h1.put("m", json!(1)).await.unwrap();
        assert_eq!(h2.get("m").await.unwrap(), Some(json!(1)));
        assert_eq!(b.log_addresses(), vec![log.address().clone()]);
    }

    #[tokio::test]
    async fn closed_log_rejects_writes() {
        let net = MemoryNetwork::new();
        let node = net.join();
        let log = node.create("posts").await.unwrap();
        log.close().await.unwrap();
        assert!(matches!(
            log.put("k", json!(1)).await,
            Err(StoreError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn blobs_fetch_from_online_peers_only() {
        let net = MemoryNetwork::new();
        let a = net.join();
        let b = net.join();
        let cid = a.add(Bytes::from_static(b"cat")).await.unwrap();

        a.set_online(false);
        assert!(matches!(b.fetch(&cid).await, Err(StoreError::BlobUnavailable(_))));
        a.set_online(true);
        assert_eq!(b.fetch(&cid).await.unwrap(), Bytes::from_static(b"cat"));
        assert_eq!(b.fetch_attempts(&cid), 2);
        assert!(b.has_blob(&cid));
    }

    #[tokio::test]
    async fn pin_requires_local_bytes() {
        let net = MemoryNetwork::new();
        let node = net.join();
        let missing = Cid::for_bytes(b"nope");
        assert!(matches!(node.pin(&missing).await, Err(StoreError::NotFound(_))));

        let cid = node.add(Bytes::from_static(b"yes")).await.unwrap();
        node.pin(&cid).await.unwrap();
        assert!(node.is_pinned(&cid));
    }

    #[tokio::test]
    async fn persistent_node_reloads_logs_and_pins() {
        let tmp = tempfile::tempdir().unwrap();
        let net = MemoryNetwork::new();
        let (address, cid) = {
            let node = net.join_persistent(DataDir::open(tmp.path()).unwrap()).unwrap();
            let log = node.create("settings").await.unwrap();
            log.put("blogName", json!("B")).await.unwrap();
            let cid = node.add(Bytes::from_static(b"avatar")).await.unwrap();
            node.pin(&cid).await.unwrap();
            (log.address().clone(), cid)
        };

        let net2 = MemoryNetwork::new();
        let node = net2.join_persistent(DataDir::open(tmp.path()).unwrap()).unwrap();
        let log = node.open(&address).await.unwrap();
        assert_eq!(log.get("blogName").await.unwrap(), Some(json!("B")));
        assert!(node.is_pinned(&cid));
        assert!(node.has_blob(&cid));
    }

    #[tokio::test]
    async fn persistent_reload_drops_forged_records() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::open(tmp.path()).unwrap();
        let net = MemoryNetwork::new();
        let node = net.join_persistent(dir.clone()).unwrap();
        let log = node.create("posts").await.unwrap();
        let address = log.address().clone();

        let genuine = log.put("p1", json!("ok")).await.unwrap();
        let mut forged = genuine.clone();
        forged.key = "p2".into();
        forged.clock = 99;
        let forged_key = record_key(&address, &forged);
        dir.datastore().put(&forged_key, &forged).unwrap();

        let node = MemoryNetwork::new().join_persistent(dir.clone()).unwrap();
        let log = node.open(&address).await.unwrap();
        let view = log.all().await.unwrap();
        assert!(view.contains_key("p1"));
        assert!(!view.contains_key("p2"));
        assert_eq!(dir.datastore().get::<LogRecord>(&forged_key).unwrap(), None);
    }

    #[tokio::test]
    async fn writes_persist_one_entry_per_record() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::open(tmp.path()).unwrap();
        let node = MemoryNetwork::new().join_persistent(dir.clone()).unwrap();
        let log = node.create("posts").await.unwrap();
        for n in 0..20 {
            log.put(&format!("p{n}"), json!(n)).await.unwrap();
        }
        let prefix = format!("{RECORD_KEY_PREFIX}{}/", log.address());
        assert_eq!(dir.datastore().keys_with_prefix(&prefix).unwrap().len(), 20);

        let node = MemoryNetwork::new().join_persistent(dir).unwrap();
        let log = node.open(log.address()).await.unwrap();
        assert_eq!(log.all().await.unwrap().len(), 20);
    }
}
