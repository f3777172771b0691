//! Observability infrastructure for the sync engine
//!
//! Provides:
//! - Prometheus metrics (queue depth, flush outcomes, refresh calls, transport failures, sync duration)
//! - Structured logging of sync lifecycle events with tracing

use crate::models::SyncSummary;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Histogram buckets for flush and sync durations (in seconds)
const DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 30.0, 60.0, 300.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<SyncMetricsInner> = OnceLock::new();

struct SyncMetricsInner {
    queue_depth: IntGauge,
    queue_enqueued: IntCounter,
    queue_evicted: IntCounter,
    queue_dropped: IntCounter,
    flush_items: IntCounterVec,
    flush_duration_seconds: Histogram,
    refresh_calls: IntCounter,
    sessions_expired: IntCounter,
    transport_failures: IntCounterVec,
    records_synced: IntCounter,
    record_type_failures: IntCounter,
    chunks_sealed: IntCounter,
    sync_duration_seconds: Histogram,
}

impl SyncMetricsInner {
    fn new() -> Self {
        Self {
            queue_depth: register_int_gauge!(
                "health_sync_queue_depth",
                "Number of payloads waiting in the offline queue"
            )
            .expect("Failed to register queue_depth"),

            queue_enqueued: register_int_counter!(
                "health_sync_queue_enqueued_total",
                "Payloads added to the offline queue"
            )
            .expect("Failed to register queue_enqueued"),

            queue_evicted: register_int_counter!(
                "health_sync_queue_evicted_total",
                "Payloads evicted because the offline queue was full"
            )
            .expect("Failed to register queue_evicted"),

            queue_dropped: register_int_counter!(
                "health_sync_queue_dropped_total",
                "Payloads dropped after exhausting their retries"
            )
            .expect("Failed to register queue_dropped"),

            flush_items: register_int_counter_vec!(
                "health_sync_flush_items_total",
                "Queue items processed by flushes, by outcome",
                &["outcome"]
            )
            .expect("Failed to register flush_items"),

            flush_duration_seconds: register_histogram!(
                "health_sync_flush_duration_seconds",
                "Time spent in one queue flush, including backoff waits",
                DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register flush_duration_seconds"),

            refresh_calls: register_int_counter!(
                "health_sync_refresh_calls_total",
                "Token refresh calls sent to the service"
            )
            .expect("Failed to register refresh_calls"),

            sessions_expired: register_int_counter!(
                "health_sync_sessions_expired_total",
                "Sessions cleared after a failed refresh"
            )
            .expect("Failed to register sessions_expired"),

            transport_failures: register_int_counter_vec!(
                "health_sync_transport_failures_total",
                "Failed requests by error classification",
                &["kind"]
            )
            .expect("Failed to register transport_failures"),

            records_synced: register_int_counter!(
                "health_sync_records_synced_total",
                "Records accepted by the service during sync runs"
            )
            .expect("Failed to register records_synced"),

            record_type_failures: register_int_counter!(
                "health_sync_record_type_failures_total",
                "Record types whose submission failed during a sync run"
            )
            .expect("Failed to register record_type_failures"),

            chunks_sealed: register_int_counter!(
                "health_sync_chunks_sealed_total",
                "Sensor chunks sealed by the chunk builder"
            )
            .expect("Failed to register chunks_sealed"),

            sync_duration_seconds: register_histogram!(
                "health_sync_sync_duration_seconds",
                "Duration of complete sync runs",
                DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register sync_duration_seconds"),
        }
    }
}

/// Sync engine metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the same
/// underlying metrics.
#[derive(Clone)]
pub struct SyncMetrics {
    _private: (),
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(SyncMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &SyncMetricsInner {
        GLOBAL_METRICS.get_or_init(SyncMetricsInner::new)
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.inner().queue_depth.set(depth as i64);
    }

    pub fn queue_depth(&self) -> i64 {
        self.inner().queue_depth.get()
    }

    pub fn inc_queue_enqueued(&self) {
        self.inner().queue_enqueued.inc();
    }

    pub fn inc_queue_evicted(&self) {
        self.inner().queue_evicted.inc();
    }

    pub fn inc_queue_dropped(&self) {
        self.inner().queue_dropped.inc();
    }

    /// Record the outcome of one flush
    pub fn observe_flush(&self, success: usize, failed: usize, retried: usize, elapsed: Duration) {
        let inner = self.inner();
        inner
            .flush_items
            .with_label_values(&["success"])
            .inc_by(success as u64);
        inner
            .flush_items
            .with_label_values(&["failed"])
            .inc_by(failed as u64);
        inner
            .flush_items
            .with_label_values(&["retried"])
            .inc_by(retried as u64);
        inner.flush_duration_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn inc_refresh_calls(&self) {
        self.inner().refresh_calls.inc();
    }

    pub fn refresh_calls(&self) -> u64 {
        self.inner().refresh_calls.get()
    }

    pub fn inc_session_expired(&self) {
        self.inner().sessions_expired.inc();
    }

    pub fn inc_transport_failure(&self, kind: &str) {
        self.inner()
            .transport_failures
            .with_label_values(&[kind])
            .inc();
    }

    pub fn inc_records_synced(&self, count: usize) {
        self.inner().records_synced.inc_by(count as u64);
    }

    pub fn inc_record_type_failures(&self) {
        self.inner().record_type_failures.inc();
    }

    pub fn inc_chunks_sealed(&self) {
        self.inner().chunks_sealed.inc();
    }

    pub fn observe_sync_duration(&self, elapsed: Duration) {
        self.inner().sync_duration_seconds.observe(elapsed.as_secs_f64());
    }
}

/// Structured logger for sync lifecycle events
///
/// Every event carries a stable `event` field so log pipelines can key on it.
#[derive(Clone)]
pub struct StructuredLogger {
    device_id: String,
}

impl StructuredLogger {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    pub fn log_sync_started(&self, record_types: usize, from: &str, to: &str) {
        info!(
            event = "sync_started",
            device = %self.device_id,
            record_types = record_types,
            from = %from,
            to = %to,
            "Sync run started"
        );
    }

    pub fn log_sync_completed(&self, summary: &SyncSummary, elapsed: Duration) {
        if summary.failed_types.is_empty() {
            info!(
                event = "sync_completed",
                device = %self.device_id,
                total = summary.total,
                synced = summary.synced,
                duration_ms = elapsed.as_millis() as u64,
                "Sync run completed"
            );
        } else {
            warn!(
                event = "sync_completed",
                device = %self.device_id,
                total = summary.total,
                synced = summary.synced,
                failed_types = ?summary.failed_types,
                duration_ms = elapsed.as_millis() as u64,
                "Sync run completed with failed record types"
            );
        }
    }

    pub fn log_record_type_failed(&self, record_type: &str, records: usize, error: &str, queued: bool) {
        warn!(
            event = "record_type_failed",
            device = %self.device_id,
            record_type = %record_type,
            records = records,
            queued = queued,
            error = %error,
            "Record type failed to sync, continuing with the next type"
        );
    }

    pub fn log_chunk_sealed(&self, samples: usize, destination: &str) {
        info!(
            event = "chunk_sealed",
            device = %self.device_id,
            samples = samples,
            destination = %destination,
            "Sensor chunk sealed"
        );
    }

    pub fn log_startup(&self, version: &str, base_url: &str) {
        info!(
            event = "agent_started",
            device = %self.device_id,
            agent_version = %version,
            base_url = %base_url,
            "Health sync agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            device = %self.device_id,
            reason = %reason,
            "Health sync agent shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_metrics_handles_share_state() {
        let metrics = SyncMetrics::new();
        let other = metrics.clone();

        let before = metrics.refresh_calls();
        other.inc_refresh_calls();
        assert!(metrics.refresh_calls() > before);

        metrics.set_queue_depth(3);
        metrics.inc_transport_failure("network");
        metrics.observe_flush(1, 0, 2, Duration::from_millis(20));
        metrics.observe_sync_duration(Duration::from_secs(1));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("watch-1");
        assert_eq!(logger.device_id, "watch-1");
    }
}
