//! Replication and pinning metrics for blogmesh.
//!
//! [`SyncMetrics`] holds monotonic `{operation, status}` counters, per
//! operation duration histograms and a few gauges. Components record into it;
//! reporting is read-only, either through [`SyncMetrics::encode`] (OpenMetrics
//! text, served by the relay's HTTP endpoint) or by flushing to a
//! [`MetricsSink`].

pub mod error;
pub mod metrics;
pub mod sink;

pub use error::{MetricsError, MetricsResult};
pub use metrics::{Operation, OperationTimer, Status, SyncMetrics};
pub use sink::{FileSink, MetricsSink};
