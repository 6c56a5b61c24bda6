use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use blogmesh_metrics::{Operation, Status, SyncMetrics};
use blogmesh_store::{BlobStore, LogEvent, LogHandle, LogStore, StoreError, StoreResult};
use blogmesh_types::{Cid, LogAddress};
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ClientError, ClientResult};
use crate::observers::BlogObservers;
use crate::state::{media_from_view, posts_from_view, BlogSettings, BlogState};

/// Polling behaviour of [`BlogClient::switch_to_remote`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Pause between attempts while the blog is incomplete.
    pub poll_interval: Duration,
    /// Give up with [`ClientError::Timeout`] after this long. `None` waits
    /// until the blog arrives or the call is cancelled.
    pub max_wait: Option<Duration>,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_wait: None,
        }
    }
}

#[derive(Clone)]
struct Stores {
    logs: Arc<dyn LogStore>,
    blobs: Arc<dyn BlobStore>,
}

/// Reader of remote blogs.
///
/// Starts without storage; [`BlogClient::initialize`] attaches the log and
/// blob stores once the local node is up. Acquired blogs are published to
/// [`BlogClient::observers`].
pub struct BlogClient {
    stores: RwLock<Option<Stores>>,
    observers: BlogObservers,
    metrics: Arc<SyncMetrics>,
    options: AcquireOptions,
}

impl BlogClient {
    pub fn new(options: AcquireOptions, metrics: Arc<SyncMetrics>) -> Self {
        Self {
            stores: RwLock::new(None),
            observers: BlogObservers::new(),
            metrics,
            options,
        }
    }

    /// Attach the local node's stores. Replaces any stores attached earlier.
    pub fn initialize(&self, logs: Arc<dyn LogStore>, blobs: Arc<dyn BlobStore>) {
        *self.stores.write().expect("client lock poisoned") = Some(Stores { logs, blobs });
        debug!("blog client initialized");
    }

    pub fn is_initialized(&self) -> bool {
        self.stores.read().expect("client lock poisoned").is_some()
    }

    pub fn observers(&self) -> &BlogObservers {
        &self.observers
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<BlogState>> {
        self.observers.subscribe()
    }

    pub fn options(&self) -> &AcquireOptions {
        &self.options
    }

    fn stores(&self) -> ClientResult<Stores> {
        self.stores
            .read()
            .expect("client lock poisoned")
            .clone()
            .ok_or(ClientError::NotInitialized)
    }

    /// Wait until the blog whose settings log lives at `address` has
    /// replicated far enough to show, then publish and return it.
    ///
    /// Fails immediately with [`ClientError::NotInitialized`] when no stores
    /// are attached. Every other failure (unreachable logs, incomplete
    /// settings) is retried after [`AcquireOptions::poll_interval`] until
    /// `cancel` fires or [`AcquireOptions::max_wait`] elapses.
    pub async fn switch_to_remote(
        &self,
        address: &LogAddress,
        cancel: Option<&CancellationToken>,
    ) -> ClientResult<BlogState> {
        let stores = self.stores()?;
        if self
            .observers
            .current()
            .is_some_and(|state| &state.address != address)
        {
            self.observers.clear();
        }

        let timer = self.metrics.start(Operation::Acquire);
        match self.acquire(stores.logs.as_ref(), address, cancel).await {
            Ok(state) => {
                timer.finish(Status::Ok);
                info!(
                    %address,
                    name = %state.settings.name,
                    posts = state.posts.len(),
                    "blog acquired"
                );
                self.observers.publish(state.clone());
                Ok(state)
            }
            Err(e) => {
                let status = match e {
                    ClientError::Cancelled => Status::Skipped,
                    _ => Status::Error,
                };
                timer.finish(status);
                debug!(%address, error = %e, "blog acquisition stopped");
                Err(e)
            }
        }
    }

    async fn acquire(
        &self,
        logs: &dyn LogStore,
        address: &LogAddress,
        cancel: Option<&CancellationToken>,
    ) -> ClientResult<BlogState> {
        let started = Instant::now();
        let mut settings_log = None;
        let mut attempt: u64 = 0;
        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(ClientError::Cancelled);
            }
            attempt += 1;
            if let Some(state) = snapshot(logs, address, &mut settings_log).await {
                return Ok(state);
            }
            if let Some(max_wait) = self.options.max_wait {
                if started.elapsed() >= max_wait {
                    return Err(ClientError::Timeout(max_wait));
                }
            }
            debug!(%address, attempt, "blog incomplete, polling again");
            pause(self.options.poll_interval, cancel).await?;
        }
    }

    /// Acquire the blog, then republish it on every change to its logs until
    /// `cancel` fires.
    ///
    /// Changes that leave the settings incomplete are not published.
    pub async fn follow(&self, address: &LogAddress, cancel: &CancellationToken) -> ClientResult<()> {
        let mut state = self.switch_to_remote(address, Some(cancel)).await?;
        let logs = self.stores()?.logs;

        loop {
            let stop = cancel.child_token();
            let _forwarders = stop.clone().drop_guard();
            let (tx, mut rx) = mpsc::channel(1);
            let wanted = watch_list(address, &state);
            let mut watched = 0;
            for target in &wanted {
                match logs.open(target).await {
                    Ok(handle) => {
                        forward_changes(handle.subscribe(), tx.clone(), stop.clone());
                        watched += 1;
                    }
                    Err(e) => debug!(address = %target, error = %e, "not watching unreachable log"),
                }
            }
            drop(tx);

            // Changes made while subscribing have no event; look once first.
            let mut catch_up = true;
            loop {
                if !catch_up {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(()),
                        changed = rx.recv() => {
                            if changed.is_none() {
                                debug!(%address, "every watched log closed, no longer following");
                                return Ok(());
                            }
                        }
                    }
                }
                let retry_unwatched = !catch_up && watched < wanted.len();
                catch_up = false;

                let mut settings_log = None;
                let Some(next) = snapshot(logs.as_ref(), address, &mut settings_log).await else {
                    continue;
                };
                if self.observers.publish(next.clone()) {
                    debug!(%address, posts = next.posts.len(), "blog updated");
                }
                state = next;
                if retry_unwatched || watch_list(address, &state) != wanted {
                    break;
                }
            }
        }
    }

    /// Fetch a blob through the attached blob store.
    pub async fn fetch_media(&self, cid: &Cid) -> ClientResult<Bytes> {
        let blobs = self.stores()?.blobs;
        let bytes = blobs.fetch(cid).await?;
        if !cid.verify(&bytes) {
            return Err(StoreError::HashMismatch(*cid).into());
        }
        Ok(bytes)
    }
}

impl std::fmt::Debug for BlogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlogClient")
            .field("initialized", &self.is_initialized())
            .field("options", &self.options)
            .finish()
    }
}

/// Build the full blog state, or `None` while it is not yet complete.
async fn snapshot(
    logs: &dyn LogStore,
    address: &LogAddress,
    settings_log: &mut Option<Arc<dyn LogHandle>>,
) -> Option<BlogState> {
    if settings_log.is_none() {
        match logs.open(address).await {
            Ok(handle) => *settings_log = Some(handle),
            Err(e) => {
                debug!(%address, error = %e, "settings log not reachable yet");
                return None;
            }
        }
    }
    let handle = settings_log.as_ref()?.clone();
    let view = match handle.all().await {
        Ok(view) => view,
        Err(e) => {
            debug!(%address, error = %e, "failed to read settings");
            return None;
        }
    };
    let Some(settings) = BlogSettings::from_view(&view) else {
        debug!(%address, keys = view.len(), "settings incomplete");
        return None;
    };
    let posts = match load(logs, &settings.posts_address).await {
        Ok(view) => posts_from_view(&view),
        Err(e) => {
            debug!(address = %settings.posts_address, error = %e, "posts log not reachable yet");
            return None;
        }
    };
    let comments = load_optional(logs, settings.comments_address.as_ref())
        .await
        .map(|view| posts_from_view(&view))
        .unwrap_or_default();
    let media = load_optional(logs, settings.media_address.as_ref())
        .await
        .map(|view| media_from_view(&view))
        .unwrap_or_default();
    Some(BlogState {
        address: address.clone(),
        settings,
        posts,
        comments,
        media,
    })
}

async fn load(logs: &dyn LogStore, address: &LogAddress) -> StoreResult<BTreeMap<String, Value>> {
    logs.open(address).await?.all().await
}

async fn load_optional(
    logs: &dyn LogStore,
    address: Option<&LogAddress>,
) -> Option<BTreeMap<String, Value>> {
    let address = address?;
    match load(logs, address).await {
        Ok(view) => Some(view),
        Err(e) => {
            debug!(%address, error = %e, "optional log unavailable");
            None
        }
    }
}

fn watch_list(address: &LogAddress, state: &BlogState) -> Vec<LogAddress> {
    std::iter::once(address.clone())
        .chain(state.settings.addresses())
        .collect()
}

async fn pause(interval: Duration, cancel: Option<&CancellationToken>) -> ClientResult<()> {
    match cancel {
        Some(cancel) => tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            _ = tokio::time::sleep(interval) => Ok(()),
        },
        None => {
            tokio::time::sleep(interval).await;
            Ok(())
        }
    }
}

/// Signal `tx` on every event of one log until `stop` fires.
fn forward_changes(
    mut events: broadcast::Receiver<LogEvent>,
    tx: mpsc::Sender<()>,
    stop: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    // A full channel already holds a pending signal.
                    if let Err(TrySendError::Closed(())) = tx.try_send(()) {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use blogmesh_store::MemoryNetwork;

    fn client(options: AcquireOptions) -> (BlogClient, Arc<SyncMetrics>) {
        let metrics = Arc::new(SyncMetrics::new());
        (BlogClient::new(options, metrics.clone()), metrics)
    }

    fn attach(client: &BlogClient, net: &MemoryNetwork) {
        let node = net.join();
        client.initialize(Arc::new(node.clone()), Arc::new(node));
    }

    #[tokio::test]
    async fn uninitialized_client_fails_without_polling() {
        let (client, metrics) = client(AcquireOptions::default());
        let address = LogAddress::mint("blogmesh", b"settings");
        let err = client.switch_to_remote(&address, None).await.unwrap_err();
        assert!(matches!(err, ClientError::NotInitialized));
        assert_eq!(metrics.counter(Operation::Acquire, Status::Error), 0);
        assert!(client.observers().current().is_none());

        let err = client.fetch_media(&Cid::for_bytes(b"x")).await.unwrap_err();
        assert!(matches!(err, ClientError::NotInitialized));
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_attempt() {
        let (client, _) = client(AcquireOptions::default());
        attach(&client, &MemoryNetwork::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let address = LogAddress::mint("blogmesh", b"settings");
        let err = client.switch_to_remote(&address, Some(&cancel)).await.unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_polling() {
        let (client, metrics) = client(AcquireOptions::default());
        attach(&client, &MemoryNetwork::new());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let address = LogAddress::mint("blogmesh", b"nobody");
        let err = client.switch_to_remote(&address, Some(&cancel)).await.unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert_eq!(metrics.counter(Operation::Acquire, Status::Skipped), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn max_wait_bounds_polling() {
        let (client, metrics) = client(AcquireOptions {
            poll_interval: Duration::from_millis(500),
            max_wait: Some(Duration::from_secs(2)),
        });
        attach(&client, &MemoryNetwork::new());
        let address = LogAddress::mint("blogmesh", b"nobody");
        let err = client.switch_to_remote(&address, None).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(d) if d == Duration::from_secs(2)));
        assert_eq!(metrics.counter(Operation::Acquire, Status::Error), 1);
    }

    #[tokio::test]
    async fn fetch_media_reads_through_blob_store() {
        let net = MemoryNetwork::new();
        let publisher = net.join();
        let cid = publisher.add(Bytes::from_static(b"picture")).await.unwrap();
        let (client, _) = client(AcquireOptions::default());
        attach(&client, &net);
        assert_eq!(client.fetch_media(&cid).await.unwrap(), Bytes::from_static(b"picture"));
    }
}
