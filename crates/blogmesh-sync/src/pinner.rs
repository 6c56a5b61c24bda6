use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use blogmesh_metrics::{Operation, Status, SyncMetrics};
use blogmesh_store::{BlobStore, StoreError};
use blogmesh_types::Cid;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pinset::PinSet;

/// Fetch retry settings for [`ContentPinner`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fetch attempts per pin request before giving up until the next trigger.
    pub attempts: u32,
    /// Delay before the second attempt; doubled for each further attempt.
    pub base_delay: Duration,
    /// Upper bound on a single fetch attempt. `None` leaves attempts unbounded.
    pub fetch_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(250),
            fetch_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Per-CID result of a pin request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PinStatus {
    AlreadyPinned,
    Pinned,
    FetchFailed,
}

/// Result of [`ContentPinner::pin`], keyed by CID.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PinOutcome {
    pub results: BTreeMap<Cid, PinStatus>,
}

impl PinOutcome {
    pub fn get(&self, cid: &Cid) -> Option<PinStatus> {
        self.results.get(cid).copied()
    }

    pub fn count(&self, status: PinStatus) -> usize {
        self.results.values().filter(|s| **s == status).count()
    }
}

/// Result of the fetch currently running for a CID, shared with waiters.
type InflightSlot = Arc<tokio::sync::Mutex<Option<PinStatus>>>;

/// Fetches referenced blobs and retains them.
///
/// A CID enters the [`PinSet`] only after a full fetch in this process
/// returned bytes that hash to it. Failed CIDs stay out of the set and are
/// tried again the next time they are referenced. Concurrent requests for
/// the same CID share one fetch and its result.
pub struct ContentPinner {
    blobs: Arc<dyn BlobStore>,
    pins: PinSet,
    metrics: Arc<SyncMetrics>,
    policy: RetryPolicy,
    inflight: Mutex<HashMap<Cid, InflightSlot>>,
    cancel: CancellationToken,
}

impl ContentPinner {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        metrics: Arc<SyncMetrics>,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            blobs,
            pins: PinSet::new(),
            metrics,
            policy,
            inflight: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn pins(&self) -> &PinSet {
        &self.pins
    }

    pub fn is_pinned(&self, cid: &Cid) -> bool {
        self.pins.contains(cid)
    }

    /// Sorted list of pinned CIDs.
    pub fn pinned(&self) -> Vec<Cid> {
        self.pins.snapshot()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Abort pending fetches and backoffs. Subsequent pins fail immediately.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Pin every candidate concurrently.
    pub async fn pin(self: &Arc<Self>, candidates: &[Cid]) -> PinOutcome {
        let mut outcome = PinOutcome::default();
        let mut set = JoinSet::new();
        for cid in candidates {
            if outcome.results.insert(*cid, PinStatus::FetchFailed).is_some() {
                continue;
            }
            let pinner = self.clone();
            let cid = *cid;
            set.spawn(async move { (cid, pinner.pin_one(cid).await) });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((cid, status)) => {
                    outcome.results.insert(cid, status);
                }
                Err(e) => warn!(error = %e, "pin task failed"),
            }
        }
        outcome
    }

    async fn pin_one(&self, cid: Cid) -> PinStatus {
        if self.pins.contains(&cid) {
            self.metrics.record(Operation::Pin, Status::Skipped);
            return PinStatus::AlreadyPinned;
        }
        let slot = self.inflight_slot(cid);
        let status = {
            let mut result = slot.lock().await;
            match *result {
                // Joined a fetch that already gave up.
                Some(PinStatus::FetchFailed) => PinStatus::FetchFailed,
                Some(_) => {
                    self.metrics.record(Operation::Pin, Status::Skipped);
                    PinStatus::AlreadyPinned
                }
                None if self.pins.contains(&cid) => {
                    self.metrics.record(Operation::Pin, Status::Skipped);
                    PinStatus::AlreadyPinned
                }
                None => {
                    let status = self.fetch_and_retain(cid).await;
                    *result = Some(status);
                    status
                }
            }
        };
        self.release_inflight_slot(cid, slot);
        status
    }

    async fn fetch_and_retain(&self, cid: Cid) -> PinStatus {
        let timer = self.metrics.start(Operation::Pin);
        for attempt in 1..=self.policy.attempts {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.fetch_once(&cid).await {
                Ok(size) => {
                    if let Err(e) = self.retain(&cid).await {
                        warn!(%cid, error = %e, "blob store refused to retain fetched blob");
                        timer.finish(Status::Error);
                        return PinStatus::FetchFailed;
                    }
                    self.pins.insert(cid);
                    self.metrics.set_pinned_blobs(self.pins.len());
                    timer.finish(Status::Ok);
                    info!(%cid, size, attempt, "pinned blob");
                    return PinStatus::Pinned;
                }
                Err(e) => {
                    debug!(%cid, attempt, error = %e, "blob fetch failed");
                }
            }
            if attempt < self.policy.attempts {
                let delay = self.policy.backoff(attempt);
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        timer.finish(Status::Error);
        warn!(%cid, attempts = self.policy.attempts, "giving up on blob until it is referenced again");
        PinStatus::FetchFailed
    }

    /// One cancellable, optionally time-bounded fetch with hash verification.
    async fn fetch_once(&self, cid: &Cid) -> Result<usize, StoreError> {
        let fetch = async {
            match self.policy.fetch_timeout {
                Some(limit) => match tokio::time::timeout(limit, self.blobs.fetch(cid)).await {
                    Ok(fetched) => fetched,
                    Err(_) => Err(StoreError::BlobUnavailable(*cid)),
                },
                None => self.blobs.fetch(cid).await,
            }
        };
        let bytes = tokio::select! {
            _ = self.cancel.cancelled() => return Err(StoreError::BlobUnavailable(*cid)),
            bytes = fetch => bytes?,
        };
        if !cid.verify(&bytes) {
            return Err(StoreError::HashMismatch(*cid));
        }
        Ok(bytes.len())
    }

    async fn retain(&self, cid: &Cid) -> Result<(), StoreError> {
        if self.blobs.supports_pin() {
            self.blobs.pin(cid).await?;
        }
        Ok(())
    }

    fn inflight_slot(&self, cid: Cid) -> InflightSlot {
        self.inflight
            .lock()
            .expect("inflight lock poisoned")
            .entry(cid)
            .or_default()
            .clone()
    }

    fn release_inflight_slot(&self, cid: Cid, slot: InflightSlot) {
        let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
        // Map entry plus ours: nobody else is waiting.
        if Arc::strong_count(&slot) == 2 {
            inflight.remove(&cid);
        }
    }
}

impl std::fmt::Debug for ContentPinner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentPinner")
            .field("pinned", &self.pins.len())
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use blogmesh_store::StoreResult;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Serves one blob after `fail_first` failed fetches.
    struct FlakyStore {
        data: Bytes,
        fail_first: u32,
        fetches: AtomicU32,
        pins: AtomicU32,
        corrupt: bool,
        delay: Duration,
    }

    impl FlakyStore {
        fn new(data: &'static [u8], fail_first: u32) -> Self {
            Self {
                data: Bytes::from_static(data),
                fail_first,
                fetches: AtomicU32::new(0),
                pins: AtomicU32::new(0),
                corrupt: false,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl BlobStore for FlakyStore {
        async fn add(&self, data: Bytes) -> StoreResult<Cid> {
            Ok(Cid::for_bytes(&data))
        }

        async fn fetch(&self, cid: &Cid) -> StoreResult<Bytes> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if n <= self.fail_first {
                return Err(StoreError::BlobUnavailable(*cid));
            }
            if self.corrupt {
                return Ok(Bytes::from_static(b"garbage"));
            }
            Ok(self.data.clone())
        }

        fn supports_pin(&self) -> bool {
            true
        }

        async fn pin(&self, _cid: &Cid) -> StoreResult<()> {
            self.pins.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pinner(store: Arc<FlakyStore>) -> (Arc<ContentPinner>, Arc<SyncMetrics>) {
        let metrics = Arc::new(SyncMetrics::new());
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            fetch_timeout: Some(Duration::from_secs(1)),
        };
        (ContentPinner::new(store, metrics.clone(), policy), metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_pins() {
        let store = Arc::new(FlakyStore::new(b"photo", 2));
        let (pinner, metrics) = pinner(store.clone());
        let cid = Cid::for_bytes(b"photo");

        let outcome = pinner.pin(&[cid]).await;
        assert_eq!(outcome.get(&cid), Some(PinStatus::Pinned));
        assert_eq!(store.fetches.load(Ordering::SeqCst), 3);
        assert_eq!(store.pins.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.counter(Operation::Pin, Status::Ok), 1);
        assert_eq!(metrics.pinned_blobs(), 1);

        let again = pinner.pin(&[cid]).await;
        assert_eq!(again.get(&cid), Some(PinStatus::AlreadyPinned));
        assert_eq!(store.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_attempts_and_retries_later() {
        let store = Arc::new(FlakyStore::new(b"photo", 3));
        let (pinner, metrics) = pinner(store.clone());
        let cid = Cid::for_bytes(b"photo");

        let outcome = pinner.pin(&[cid]).await;
        assert_eq!(outcome.get(&cid), Some(PinStatus::FetchFailed));
        assert!(!pinner.is_pinned(&cid));
        assert_eq!(store.fetches.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.counter(Operation::Pin, Status::Error), 1);

        let later = pinner.pin(&[cid]).await;
        assert_eq!(later.get(&cid), Some(PinStatus::Pinned));
        assert!(pinner.is_pinned(&cid));
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_bytes_are_never_pinned() {
        let mut store = FlakyStore::new(b"photo", 0);
        store.corrupt = true;
        let store = Arc::new(store);
        let (pinner, _) = pinner(store.clone());
        let cid = Cid::for_bytes(b"photo");

        let outcome = pinner.pin(&[cid]).await;
        assert_eq!(outcome.count(PinStatus::FetchFailed), 1);
        assert!(pinner.pinned().is_empty());
        assert_eq!(store.pins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_share_one_fetch() {
        let mut store = FlakyStore::new(b"photo", 0);
        store.delay = Duration::from_millis(50);
        let store = Arc::new(store);
        let (pinner, _) = pinner(store.clone());
        let cid = Cid::for_bytes(b"photo");

        let (one, twice) = ([cid], [cid, cid]);
        let (a, b) = tokio::join!(pinner.pin(&one), pinner.pin(&twice));
        let mut statuses = vec![a.get(&cid).unwrap(), b.get(&cid).unwrap()];
        statuses.sort_by_key(|s| *s == PinStatus::Pinned);
        assert_eq!(statuses, vec![PinStatus::AlreadyPinned, PinStatus::Pinned]);
        assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
        assert!(pinner.inflight.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_retrying() {
        let store = Arc::new(FlakyStore::new(b"photo", u32::MAX));
        let (pinner, _) = pinner(store.clone());
        pinner.shutdown();
        let cid = Cid::for_bytes(b"photo");
        assert_eq!(pinner.pin(&[cid]).await.get(&cid), Some(PinStatus::FetchFailed));
        assert_eq!(store.fetches.load(Ordering::SeqCst), 0);
    }
}
