use std::fmt::{self, Write as _};
use std::time::{Duration, Instant};

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::error::MetricsResult;
use crate::sink::MetricsSink;

/// Stage of the replication pipeline being measured.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Operation {
    Dial,
    Discover,
    Open,
    Join,
    Update,
    Materialize,
    Pin,
    Acquire,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dial => "dial",
            Self::Discover => "discover",
            Self::Open => "open",
            Self::Join => "join",
            Self::Update => "update",
            Self::Materialize => "materialize",
            Self::Pin => "pin",
            Self::Acquire => "acquire",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EncodeLabelValue for Operation {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), fmt::Error> {
        encoder.write_str(self.as_str())
    }
}

/// Outcome of an operation.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    Skipped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }
}

impl EncodeLabelValue for Status {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), fmt::Error> {
        encoder.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OperationLabels {
    operation: Operation,
    status: Status,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DurationLabels {
    operation: Operation,
}

fn duration_histogram() -> Histogram {
    // 1ms .. ~32s
    Histogram::new(exponential_buckets(0.001, 2.0, 16))
}

/// Counters, histograms and gauges for the replication pipeline.
pub struct SyncMetrics {
    registry: Registry,
    operations: Family<OperationLabels, Counter>,
    durations: Family<DurationLabels, Histogram, fn() -> Histogram>,
    connected_peers: Gauge,
    open_logs: Gauge,
    pinned_blobs: Gauge,
}

impl SyncMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let sub_registry = registry.sub_registry_with_prefix("blogmesh");

        let operations = Family::<OperationLabels, Counter>::default();
        sub_registry.register(
            "operations",
            "Replication operations by outcome",
            operations.clone(),
        );

        let durations: Family<DurationLabels, Histogram, fn() -> Histogram> =
            Family::new_with_constructor(duration_histogram);
        sub_registry.register(
            "operation_duration_seconds",
            "Duration of replication operations",
            durations.clone(),
        );

        let connected_peers = Gauge::default();
        sub_registry.register(
            "connected_peers",
            "Currently connected peers",
            connected_peers.clone(),
        );

        let open_logs = Gauge::default();
        sub_registry.register("open_logs", "Logs currently replicated", open_logs.clone());

        let pinned_blobs = Gauge::default();
        sub_registry.register("pinned_blobs", "Blobs in the pin set", pinned_blobs.clone());

        Self {
            registry,
            operations,
            durations,
            connected_peers,
            open_logs,
            pinned_blobs,
        }
    }

    pub fn record(&self, operation: Operation, status: Status) {
        self.operations
            .get_or_create(&OperationLabels { operation, status })
            .inc();
    }

    pub fn observe(&self, operation: Operation, elapsed: Duration) {
        self.durations
            .get_or_create(&DurationLabels { operation })
            .observe(elapsed.as_secs_f64());
    }

    /// Start timing an operation; the outcome is recorded by [`OperationTimer::finish`].
    pub fn start(&self, operation: Operation) -> OperationTimer<'_> {
        OperationTimer {
            metrics: self,
            operation,
            started: Instant::now(),
        }
    }

    pub fn set_connected_peers(&self, count: usize) {
        self.connected_peers.set(count as i64);
    }

    pub fn set_open_logs(&self, count: usize) {
        self.open_logs.set(count as i64);
    }

    pub fn set_pinned_blobs(&self, count: usize) {
        self.pinned_blobs.set(count as i64);
    }

    /// Current value of one `{operation, status}` counter.
    pub fn counter(&self, operation: Operation, status: Status) -> u64 {
        self.operations
            .get_or_create(&OperationLabels { operation, status })
            .get()
    }

    pub fn connected_peers(&self) -> i64 {
        self.connected_peers.get()
    }

    pub fn open_logs(&self) -> i64 {
        self.open_logs.get()
    }

    pub fn pinned_blobs(&self) -> i64 {
        self.pinned_blobs.get()
    }

    /// OpenMetrics text exposition of every metric.
    pub fn encode(&self) -> MetricsResult<String> {
        let mut buf = String::new();
        encode(&mut buf, &self.registry)?;
        Ok(buf)
    }

    /// Write the current exposition to `sink`.
    pub fn flush_to(&self, sink: &dyn MetricsSink) -> MetricsResult<()> {
        let text = self.encode()?;
        sink.flush(&text)?;
        Ok(())
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SyncMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncMetrics")
            .field("connected_peers", &self.connected_peers.get())
            .field("open_logs", &self.open_logs.get())
            .field("pinned_blobs", &self.pinned_blobs.get())
            .finish()
    }
}

/// Measures one operation from creation to [`OperationTimer::finish`].
pub struct OperationTimer<'a> {
    metrics: &'a SyncMetrics,
    operation: Operation,
    started: Instant,
}

impl OperationTimer<'_> {
    /// Record the outcome and the elapsed time.
    pub fn finish(self, status: Status) -> Duration {
        let elapsed = self.started.elapsed();
        self.metrics.record(self.operation, status);
        self.metrics.observe(self.operation, elapsed);
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_keyed_by_operation_and_status() {
        let m = SyncMetrics::new();
        m.record(Operation::Open, Status::Ok);
        m.record(Operation::Open, Status::Ok);
        m.record(Operation::Open, Status::Error);
        assert_eq!(m.counter(Operation::Open, Status::Ok), 2);
        assert_eq!(m.counter(Operation::Open, Status::Error), 1);
        assert_eq!(m.counter(Operation::Pin, Status::Ok), 0);
    }

    #[test]
    fn gauges_report_latest_value() {
        let m = SyncMetrics::new();
        m.set_connected_peers(3);
        m.set_connected_peers(2);
        m.set_open_logs(4);
        m.set_pinned_blobs(7);
        assert_eq!(m.connected_peers(), 2);
        assert_eq!(m.open_logs(), 4);
        assert_eq!(m.pinned_blobs(), 7);
    }

    #[test]
    fn timer_records_counter_and_histogram() {
        let m = SyncMetrics::new();
        m.start(Operation::Pin).finish(Status::Ok);
        assert_eq!(m.counter(Operation::Pin, Status::Ok), 1);
        let text = m.encode().unwrap();
        assert!(text.contains("blogmesh_operation_duration_seconds_count{operation=\"pin\"} 1"));
    }

    #[test]
    fn exposition_names_and_labels() {
        let m = SyncMetrics::new();
        m.record(Operation::Join, Status::Ok);
        m.set_connected_peers(1);
        let text = m.encode().unwrap();
        assert!(text.contains("blogmesh_operations_total{operation=\"join\",status=\"ok\"} 1"));
        assert!(text.contains("blogmesh_connected_peers 1"));
        assert!(text.ends_with("# EOF\n"));
    }
}
