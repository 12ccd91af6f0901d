//! Metric definitions for the SFU node.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `event`: client event names (~14 values)
//! - `status`: success, error
//! - `scope`: connection, connection_message, user_message
//! - `operation`: coordinator operations (~6 values)
//! - `reason`: session-ended reasons (~3 values)
//! - `actor_type`: directory, room, connection

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used by `/metrics`.
///
/// Must be called before any metric is recorded.
///
/// # Errors
///
/// Returns error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_message".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_allocation".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
            ],
        )
        .map_err(|e| format!("Failed to set allocation buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

fn status_label(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "error"
    }
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `sfu_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_connections_active").set(count as f64);
}

/// Metric: `sfu_rooms_active`
///
/// Rooms with at least one participant connected to this replica.
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_rooms_active").set(count as f64);
}

/// Metric: `sfu_workers_live`
pub fn set_workers_live(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_workers_live").set(count as f64);
}

/// Metric: `sfu_mailbox_depth`
/// Labels: `actor_type`
pub fn set_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Histograms
// ============================================================================

/// Record client message processing latency.
///
/// Metric: `sfu_message_processing_duration_seconds`
/// Labels: `event`, `status`
pub fn record_message_processed(event: &str, success: bool, duration: Duration) {
    histogram!(
        "sfu_message_processing_duration_seconds",
        "event" => event.to_string(),
        "status" => status_label(success)
    )
    .record(duration.as_secs_f64());
}

/// Record one allocation attempt.
///
/// Metric: `sfu_allocation_duration_seconds`
/// Labels: `status`
pub fn record_allocation(duration: Duration, success: bool) {
    histogram!("sfu_allocation_duration_seconds", "status" => status_label(success))
        .record(duration.as_secs_f64());
}

// ============================================================================
// Counters
// ============================================================================

/// Metric: `sfu_admission_denied_total`
/// Labels: `scope`
pub fn record_admission_denied(scope: &str) {
    counter!("sfu_admission_denied_total", "scope" => scope.to_string()).increment(1);
}

/// Metric: `sfu_worker_restarts_total`
///
/// Any non-zero rate means media workers are crashing.
pub fn record_worker_restart() {
    counter!("sfu_worker_restarts_total").increment(1);
}

/// Metric: `sfu_sessions_ended_total`
/// Labels: `reason`
pub fn record_session_ended(reason: &str) {
    counter!("sfu_sessions_ended_total", "reason" => reason.to_string()).increment(1);
}

/// Metric: `sfu_coordination_operations_total`
/// Labels: `operation`, `status`
pub fn record_coordination_operation(operation: &str, success: bool) {
    counter!(
        "sfu_coordination_operations_total",
        "operation" => operation.to_string(),
        "status" => status_label(success)
    )
    .increment(1);
}

/// Metric: `sfu_messages_dropped_total`
/// Labels: `actor_type`
pub fn record_message_dropped(actor_type: &str) {
    counter!("sfu_messages_dropped_total", "actor_type" => actor_type.to_string()).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_recording_without_recorder_is_noop() {
        set_connections_active(3);
        set_rooms_active(1);
        set_workers_live(4);
        set_mailbox_depth("room", 10);
        record_message_processed("produce", true, Duration::from_millis(3));
        record_allocation(Duration::from_millis(12), false);
        record_admission_denied("connection");
        record_worker_restart();
        record_session_ended("worker_lost");
        record_coordination_operation("allocate", true);
        record_message_dropped("connection");
    }

    #[test]
    fn test_counters_carry_bounded_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_admission_denied("user_message");
            record_admission_denied("user_message");
            record_coordination_operation("release", false);
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let denied = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "sfu_admission_denied_total")
            .expect("admission counter recorded");
        assert!(denied
            .0
            .key()
            .labels()
            .any(|label| label.key() == "scope" && label.value() == "user_message"));
        assert_eq!(denied.3, DebugValue::Counter(2));

        let coordination = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "sfu_coordination_operations_total")
            .expect("coordination counter recorded");
        assert!(coordination
            .0
            .key()
            .labels()
            .any(|label| label.key() == "status" && label.value() == "error"));
    }
}
