//! Metrics for consumer-group coordination
//!
//! Prometheus-compatible metrics behind the `metrics` feature. Without the
//! feature every function is a no-op, so call sites compile either way.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge, histogram};
#[cfg(feature = "metrics")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(feature = "metrics")]
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and return its handle.
///
/// The recorder is process-global; the first call wins and later calls get
/// the same handle.
#[cfg(feature = "metrics")]
pub fn init_metrics() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "metrics recorder already installed elsewhere");
                    PrometheusBuilder::new().build_recorder().handle()
                })
        })
        .clone()
}

/// Record a completed or abandoned rebalance
#[cfg(feature = "metrics")]
pub fn record_rebalance(group_id: &str, outcome: &str) {
    counter!(
        "muster_rebalances_total",
        "group" => group_id.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record how long a rebalance took end to end
#[cfg(feature = "metrics")]
pub fn record_rebalance_duration(group_id: &str, duration_ms: u64) {
    histogram!(
        "muster_rebalance_duration_ms",
        "group" => group_id.to_string()
    )
    .record(duration_ms as f64);
}

/// Record how many partitions this consumer owns after a rebalance
#[cfg(feature = "metrics")]
pub fn record_owned_partitions(group_id: &str, count: usize) {
    gauge!(
        "muster_owned_partitions",
        "group" => group_id.to_string()
    )
    .set(count as f64);
}

#[cfg(not(feature = "metrics"))]
pub fn record_rebalance(_group_id: &str, _outcome: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn record_rebalance_duration(_group_id: &str, _duration_ms: u64) {}

#[cfg(not(feature = "metrics"))]
pub fn record_owned_partitions(_group_id: &str, _count: usize) {}
