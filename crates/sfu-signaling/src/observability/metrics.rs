//! Metrics definitions for the SFU signaling service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `actor_type`: 3 values (registry, room, connection)
//! - `request_type`: bounded by the signaling request set (~20 values)
//! - `status`: success, error
//! - `entity`: transport, producer, consumer
//! - `worker`: bounded by `SFU_NUM_WORKERS`
//!
//! Room, peer and entity identifiers are never used as labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus metrics recorder and return the handle used to
/// render `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling request latency: engine round-trips included
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_signaling_request".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set signaling request buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Room & Peer Metrics (Gauges)
// ============================================================================

/// Set the number of active rooms.
///
/// Metric: `sfu_rooms_active`
pub fn set_rooms_active(count: u64) {
    // u64 to f64 conversion is safe for realistic room counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_rooms_active").set(count as f64);
}

/// Set the number of joined peers across all rooms.
///
/// Metric: `sfu_peers_active`
pub fn set_peers_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_peers_active").set(count as f64);
}

/// Set the number of live routers hosted by a worker.
///
/// Metric: `sfu_worker_load`
/// Labels: `worker`
pub fn set_worker_load(worker_index: usize, load: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_worker_load", "worker" => worker_index.to_string()).set(load as f64);
}

// ============================================================================
// Actor Mailbox Metrics (Gauges)
// ============================================================================

/// Set the mailbox depth for an actor type.
///
/// Metric: `sfu_actor_mailbox_depth`
/// Labels: `actor_type` (registry, room, connection)
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Signaling Request Metrics
// ============================================================================

/// Record a completed signaling request.
///
/// Emits:
/// - `sfu_signaling_requests_total` counter (labels: `request_type`, `status`)
/// - `sfu_signaling_request_duration_seconds` histogram (labels: `request_type`)
pub fn record_signaling_request(request_type: &str, status: &str, duration: Duration) {
    histogram!("sfu_signaling_request_duration_seconds",
        "request_type" => request_type.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("sfu_signaling_requests_total",
        "request_type" => request_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

// ============================================================================
// Lifecycle Counters
// ============================================================================

/// Record entities closed by a cascade (transport, producer, consumer).
///
/// Metric: `sfu_cascade_closed_total`
/// Labels: `entity`
pub fn record_cascade_closed(entity: &str, count: u64) {
    if count == 0 {
        return;
    }
    counter!("sfu_cascade_closed_total", "entity" => entity.to_string()).increment(count);
}

/// Record a notification dropped because a peer's egress queue was full.
///
/// Metric: `sfu_notifications_dropped_total`
pub fn record_notification_dropped() {
    counter!("sfu_notifications_dropped_total").increment(1);
}

/// Record an unexpected media worker termination.
///
/// Metric: `sfu_worker_deaths_total`
///
/// ALERT: Any non-zero value means the process is restarting.
pub fn record_worker_death() {
    counter!("sfu_worker_deaths_total").increment(1);
}

/// Record an actor panic event.
///
/// Metric: `sfu_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug and should trigger investigation.
pub fn record_actor_panic(actor_type: &str) {
    counter!("sfu_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}
