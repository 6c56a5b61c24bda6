use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use blogmesh_metrics::{Operation, Status, SyncMetrics};
use blogmesh_net::{head_protocol, DiscoverySink, PeerLink, TopicMessage};
use blogmesh_store::{LogEvent, LogHandle, LogStore, StoreError};
use blogmesh_types::{Cid, LogAddress, LogKind, PeerId};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::pinner::{ContentPinner, PinStatus};
use crate::refs;
use crate::state::{LogState, OpenOutcome};

/// Result of one store open, shared with every caller that waited on it.
type Attempt = Option<Result<Arc<dyn LogHandle>, Arc<StoreError>>>;

struct TrackedLog {
    state: LogState,
    /// Kind implied by how the address was reached, if any.
    hint: Option<LogKind>,
    kind: LogKind,
    handle: Option<Arc<dyn LogHandle>>,
    /// Replaced at the start of every open attempt.
    attempt: Arc<watch::Sender<Attempt>>,
}

impl TrackedLog {
    fn opening(hint: Option<LogKind>) -> Self {
        Self {
            state: LogState::Opening,
            hint,
            kind: hint.unwrap_or(LogKind::Other),
            handle: None,
            attempt: Arc::new(watch::channel(None).0),
        }
    }

    /// Adopt a more specific kind than `Other`.
    ///
    /// Returns the handle to rematerialize when an open log changed kind.
    fn refine(&mut self, hint: Option<LogKind>) -> Option<Arc<dyn LogHandle>> {
        let hint = hint.filter(|h| *h != LogKind::Other)?;
        if self.hint.is_none() {
            self.hint = Some(hint);
        }
        if self.kind != LogKind::Other || !self.state.is_active() {
            return None;
        }
        self.kind = hint;
        self.handle.clone()
    }
}

enum Claim {
    /// This caller runs the store open.
    Open(Option<LogKind>, Arc<watch::Sender<Attempt>>),
    /// Another caller is opening; wait for its attempt.
    Wait(watch::Receiver<Attempt>),
    Done(OpenOutcome),
}

/// Mirrors logs and follows their cross-references.
///
/// Every address moves through [`LogState`]. Transitions happen under a
/// short write lock on the address map, never across an `.await`, so two
/// addresses open concurrently without coordinating. Concurrent opens of
/// one address share a single store open and receive the same handle or
/// the same error. Each open log is driven by its own task reading the
/// log's change stream:
///
/// - `Joined`: materialize.
/// - `Updated`: materialize; for media logs, pin the blobs of the new
///   records instead.
/// - lagged stream: materialize, since events were lost.
///
/// Materializing a settings log opens every referenced posts, comments and
/// media log not already opening or open, and pins the profile picture.
/// Materializing a media log pins every referenced blob. A reference to a
/// log nobody provides yet fails to open, returns to `Unopened` and is
/// retried on the next materialization.
///
/// A log discovered without a role is classified by its manifest name.
/// If it lands on `Other` and a settings log later names its role, the
/// log adopts that kind and is rematerialized.
pub struct ReplicationTracker {
    me: Weak<Self>,
    store: Arc<dyn LogStore>,
    pinner: Arc<ContentPinner>,
    metrics: Arc<SyncMetrics>,
    advertiser: Option<Arc<dyn PeerLink>>,
    logs: RwLock<HashMap<LogAddress, TrackedLog>>,
    accepting: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ReplicationTracker {
    /// `advertiser`, when set, advertises a head protocol for every opened
    /// log so peers can discover them through this node.
    pub fn new(
        store: Arc<dyn LogStore>,
        pinner: Arc<ContentPinner>,
        metrics: Arc<SyncMetrics>,
        advertiser: Option<Arc<dyn PeerLink>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            store,
            pinner,
            metrics,
            advertiser,
            logs: RwLock::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn pinner(&self) -> &Arc<ContentPinner> {
        &self.pinner
    }

    /// Open `address` and start replicating it.
    ///
    /// `hint` overrides the kind derived from the log's manifest name. A
    /// call that finds the address already opening waits for that open and
    /// shares its handle or error. On failure the address returns to
    /// `Unopened`.
    pub async fn open(
        self: &Arc<Self>,
        address: &LogAddress,
        hint: Option<LogKind>,
    ) -> SyncResult<OpenOutcome> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Ok(OpenOutcome::ShuttingDown);
        }
        match self.claim(address, hint) {
            Claim::Open(hint, attempt) => self.run_open(address, hint, attempt).await,
            Claim::Wait(mut attempt) => {
                let shared = match attempt.wait_for(Option::is_some).await {
                    Ok(done) => done.clone(),
                    Err(_) => None,
                };
                match shared {
                    Some(Err(source)) => Err(SyncError::Open {
                        address: address.clone(),
                        source,
                    }),
                    _ => Ok(self.outcome_of(address)),
                }
            }
            Claim::Done(outcome) => Ok(outcome),
        }
    }

    fn claim(self: &Arc<Self>, address: &LogAddress, hint: Option<LogKind>) -> Claim {
        let mut logs = self.logs.write().expect("tracker lock poisoned");
        let Some(tracked) = logs.get_mut(address) else {
            let tracked = TrackedLog::opening(hint);
            let attempt = tracked.attempt.clone();
            logs.insert(address.clone(), tracked);
            return Claim::Open(hint, attempt);
        };
        match tracked.state {
            LogState::Unopened => {
                tracked.state = LogState::Opening;
                tracked.hint = hint.or(tracked.hint);
                tracked.attempt = Arc::new(watch::channel(None).0);
                Claim::Open(tracked.hint, tracked.attempt.clone())
            }
            LogState::Opening => {
                tracked.refine(hint);
                Claim::Wait(tracked.attempt.subscribe())
            }
            LogState::Closed => Claim::Done(OpenOutcome::ShuttingDown),
            state => {
                if let Some(handle) = tracked.refine(hint) {
                    self.spawn_rematerialize(address.clone(), handle, tracked.kind);
                }
                match &tracked.handle {
                    Some(handle) => Claim::Done(OpenOutcome::AlreadyTracked(state, handle.clone())),
                    None => Claim::Done(OpenOutcome::ShuttingDown),
                }
            }
        }
    }

    async fn run_open(
        self: &Arc<Self>,
        address: &LogAddress,
        hint: Option<LogKind>,
        attempt: Arc<watch::Sender<Attempt>>,
    ) -> SyncResult<OpenOutcome> {
        let timer = self.metrics.start(Operation::Open);
        let handle = match self.store.open(address).await {
            Ok(handle) => handle,
            Err(e) => {
                let source = Arc::new(e);
                self.set_state(address, LogState::Unopened);
                attempt.send_replace(Some(Err(source.clone())));
                timer.finish(Status::Error);
                if source.is_transient() {
                    debug!(%address, error = %source, "log not reachable yet");
                } else {
                    warn!(%address, error = %source, "failed to open log");
                }
                return Err(SyncError::Open {
                    address: address.clone(),
                    source,
                });
            }
        };

        // Subscribe before the initial materialization so no update is missed.
        let events = handle.subscribe();
        let (accepted, kind) = {
            let mut logs = self.logs.write().expect("tracker lock poisoned");
            let accepting = self.accepting.load(Ordering::SeqCst);
            let mut kind = hint.unwrap_or_else(|| LogKind::from_name(handle.name()));
            if let Some(tracked) = logs.get_mut(address) {
                // A hint may have arrived while the store was opening.
                if let Some(late) = tracked.hint {
                    kind = late;
                }
                tracked.kind = kind;
                tracked.handle = Some(handle.clone());
                tracked.state = if accepting {
                    LogState::Open
                } else {
                    LogState::Closed
                };
            }
            (accepting, kind)
        };
        attempt.send_replace(Some(Ok(handle.clone())));
        if !accepted {
            timer.finish(Status::Skipped);
            if let Err(e) = handle.close().await {
                warn!(%address, error = %e, "failed to close log opened during shutdown");
            }
            return Ok(OpenOutcome::ShuttingDown);
        }

        timer.finish(Status::Ok);
        self.update_gauge();
        if let Some(link) = &self.advertiser {
            link.advertise(head_protocol(address));
        }
        info!(%address, %kind, name = handle.name(), "replicating log");

        let tracker = self.clone();
        let driven = handle.clone();
        let address = address.clone();
        self.tasks
            .spawn(async move { tracker.drive(address, driven, events).await });
        Ok(OpenOutcome::Opened(handle))
    }

    fn outcome_of(&self, address: &LogAddress) -> OpenOutcome {
        let logs = self.logs.read().expect("tracker lock poisoned");
        match logs.get(address) {
            Some(tracked) if tracked.state != LogState::Closed => match &tracked.handle {
                Some(handle) => OpenOutcome::AlreadyTracked(tracked.state, handle.clone()),
                None => OpenOutcome::ShuttingDown,
            },
            _ => OpenOutcome::ShuttingDown,
        }
    }

    /// Open `address` in the background unless it is already opening or open.
    ///
    /// For a tracked address, `hint` may still refine a log classified `Other`.
    pub fn spawn_open(self: &Arc<Self>, address: LogAddress, hint: Option<LogKind>) {
        {
            let mut logs = self.logs.write().expect("tracker lock poisoned");
            if let Some(tracked) = logs.get_mut(&address) {
                if tracked.state != LogState::Unopened {
                    if let Some(handle) = tracked.refine(hint) {
                        info!(%address, kind = %tracked.kind, "log kind refined");
                        self.spawn_rematerialize(address, handle, tracked.kind);
                    }
                    return;
                }
            }
        }
        let tracker = self.clone();
        self.tasks.spawn(async move {
            if let Err(e) = tracker.open(&address, hint).await {
                debug!(%address, error = %e, "open deferred to next trigger");
            }
        });
    }

    fn spawn_rematerialize(self: &Arc<Self>, address: LogAddress, handle: Arc<dyn LogHandle>, kind: LogKind) {
        let tracker = self.clone();
        self.tasks.spawn(async move {
            tracker.materialize(&address, handle.as_ref(), kind).await;
        });
    }

    async fn drive(
        self: Arc<Self>,
        address: LogAddress,
        handle: Arc<dyn LogHandle>,
        mut events: broadcast::Receiver<LogEvent>,
    ) {
        self.materialize(&address, handle.as_ref(), self.current_kind(&address))
            .await;
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = events.recv() => event,
            };
            // Read per event: the kind may have been refined.
            let kind = self.current_kind(&address);
            match event {
                Ok(LogEvent::Joined { peer }) => {
                    self.set_state(&address, LogState::Joined);
                    self.metrics.record(Operation::Join, Status::Ok);
                    debug!(%address, %peer, "peer joined replication");
                    self.materialize(&address, handle.as_ref(), kind).await;
                }
                Ok(LogEvent::Updated { entries }) => {
                    self.set_state(&address, LogState::Updated);
                    self.metrics.record(Operation::Update, Status::Ok);
                    debug!(%address, entries = entries.len(), "log updated");
                    if kind == LogKind::Media {
                        // New records carry their own references.
                        self.spawn_pin(refs::record_blobs(&entries));
                    } else {
                        self.materialize(&address, handle.as_ref(), kind).await;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%address, skipped, "log events lagged, rematerializing");
                    self.materialize(&address, handle.as_ref(), kind).await;
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!(%address, "stopped driving log");
    }

    fn current_kind(&self, address: &LogAddress) -> LogKind {
        self.logs
            .read()
            .expect("tracker lock poisoned")
            .get(address)
            .map_or(LogKind::Other, |t| t.kind)
    }

    async fn materialize(
        self: &Arc<Self>,
        address: &LogAddress,
        handle: &dyn LogHandle,
        kind: LogKind,
    ) {
        let timer = self.metrics.start(Operation::Materialize);
        let view = match handle.all().await {
            Ok(view) => {
                timer.finish(Status::Ok);
                view
            }
            Err(e) => {
                timer.finish(Status::Error);
                warn!(%address, error = %e, "materialization failed");
                return;
            }
        };
        match kind {
            LogKind::Settings => {
                for (target, target_kind) in refs::settings_references(&view) {
                    if &target == address {
                        continue;
                    }
                    self.spawn_open(target, Some(target_kind));
                }
                self.spawn_pin(refs::settings_blobs(&view));
            }
            LogKind::Media => self.spawn_pin(refs::media_blobs(&view)),
            LogKind::Posts | LogKind::Comments | LogKind::Other => {}
        }
    }

    fn spawn_pin(&self, cids: Vec<Cid>) {
        if cids.is_empty() {
            return;
        }
        let pinner = self.pinner.clone();
        self.tasks.spawn(async move {
            let outcome = pinner.pin(&cids).await;
            debug!(
                requested = cids.len(),
                pinned = outcome.count(PinStatus::Pinned),
                failed = outcome.count(PinStatus::FetchFailed),
                "pin pass finished"
            );
        });
    }

    /// Open every log address announced on `messages` (payload: the address string).
    pub fn follow_announcements(self: &Arc<Self>, mut messages: broadcast::Receiver<TopicMessage>) {
        let tracker = self.clone();
        self.tasks.spawn(async move {
            loop {
                let msg = tokio::select! {
                    biased;
                    _ = tracker.cancel.cancelled() => break,
                    msg = messages.recv() => msg,
                };
                match msg {
                    Ok(msg) => {
                        let parsed = std::str::from_utf8(&msg.data)
                            .ok()
                            .and_then(|s| LogAddress::parse(s.trim()).ok());
                        match parsed {
                            Some(address) => {
                                debug!(from = %msg.from, %address, "log announced");
                                tracker.spawn_open(address, None);
                            }
                            None => debug!(from = %msg.from, "ignoring malformed announcement"),
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "announcements lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    fn set_state(&self, address: &LogAddress, state: LogState) {
        let mut logs = self.logs.write().expect("tracker lock poisoned");
        if let Some(tracked) = logs.get_mut(address) {
            if tracked.state != LogState::Closed {
                tracked.state = state;
            }
        }
    }

    fn update_gauge(&self) {
        let open = self
            .logs
            .read()
            .expect("tracker lock poisoned")
            .values()
            .filter(|t| t.state.is_active())
            .count();
        self.metrics.set_open_logs(open);
    }

    pub fn state(&self, address: &LogAddress) -> Option<LogState> {
        self.logs
            .read()
            .expect("tracker lock poisoned")
            .get(address)
            .map(|t| t.state)
    }

    pub fn kind(&self, address: &LogAddress) -> Option<LogKind> {
        self.logs
            .read()
            .expect("tracker lock poisoned")
            .get(address)
            .filter(|t| t.handle.is_some())
            .map(|t| t.kind)
    }

    /// The handle an address resolved to, if it has been opened.
    pub fn handle(&self, address: &LogAddress) -> Option<Arc<dyn LogHandle>> {
        self.logs
            .read()
            .expect("tracker lock poisoned")
            .get(address)
            .and_then(|t| t.handle.clone())
    }

    /// Snapshot of every tracked address and its state.
    pub fn states(&self) -> BTreeMap<LogAddress, LogState> {
        self.logs
            .read()
            .expect("tracker lock poisoned")
            .iter()
            .map(|(address, t)| (address.clone(), t.state))
            .collect()
    }

    /// Stop accepting opens, stop every log task and close every handle.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        self.pinner.shutdown();
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let handles: Vec<(LogAddress, Arc<dyn LogHandle>)> = {
            let mut logs = self.logs.write().expect("tracker lock poisoned");
            logs.iter_mut()
                .filter_map(|(address, t)| {
                    t.state = LogState::Closed;
                    t.handle.clone().map(|h| (address.clone(), h))
                })
                .collect()
        };
        for (address, handle) in &handles {
            if let Err(e) = handle.close().await {
                warn!(%address, error = %e, "failed to close log");
            }
        }
        self.metrics.set_open_logs(0);
        info!(closed = handles.len(), "replication tracker shut down");
    }
}

#[async_trait]
impl DiscoverySink for ReplicationTracker {
    async fn logs_discovered(&self, peer: &PeerId, addresses: Vec<LogAddress>) {
        let Some(tracker) = self.me.upgrade() else {
            return;
        };
        for address in addresses {
            debug!(%peer, %address, "peer advertises log");
            tracker.spawn_open(address, None);
        }
    }
}

impl std::fmt::Debug for ReplicationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let logs = self.logs.read().expect("tracker lock poisoned").len();
        f.debug_struct("ReplicationTracker")
            .field("logs", &logs)
            .field("accepting", &self.accepting.load(Ordering::SeqCst))
            .finish()
    }
}
