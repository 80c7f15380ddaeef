//! Prometheus metrics for the coordination engine.
//!
//! This module provides comprehensive metrics for monitoring an HA node.
//! Metrics cover:
//! - Role state and transitions (current role, epoch, promotions, demotions)
//! - Heartbeat health (peer states, missed intervals, jitter violations)
//! - Quorum (reachable votes, quorum held)
//! - Replication (records sent/applied, unacked depth, reorder buffering)
//! - Resync (snapshot transfers, checksum failures)
//! - Reconciliation (conflicts detected and resolved per strategy)
//! - Virtual resources (takeovers, announcements, backend failures)
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "carpaccio" prefix
//! to avoid name collisions with other libraries using the default Prometheus
//! registry. Registration errors are handled gracefully - if a metric fails to
//! register, a fallback no-op metric is used instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for Carpaccio metrics.
/// Using a custom registry prevents name collisions with other libraries.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("carpaccio".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================
//
// These macros reduce boilerplate for declaring metrics. Each expands to a
// Lazy static with safe registration. Examples:
//
//   define_gauge!(MY_GAUGE, "my_metric", "Description");
//   define_gauge_vec!(MY_GAUGE, "my_metric", "Description", ["label1"]);
//   define_counter_vec!(MY_COUNTER, "my_metric", "Description", ["label1"]);
//   define_histogram_vec!(MY_HISTOGRAM, "my_metric", "Description", ["label"],
//       [0.001, 0.01, 0.1, 1.0]);

/// Declare an IntGauge metric.
macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare an IntGaugeVec metric with labels.
macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntCounterVec metric with labels.
macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntCounter metric (no labels).
macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare a HistogramVec metric with labels and buckets.
macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Role metrics
// =============================================================================

define_gauge!(
    CURRENT_ROLE,
    "current_role",
    "Current role as a wire value (0=init, 1=primary, 2=backup, 3=fenced)"
);
define_gauge!(CURRENT_EPOCH, "current_epoch", "Current coordination epoch");
define_counter_vec!(
    ROLE_TRANSITIONS,
    "role_transitions_total",
    "Role transitions by source and target role",
    ["from", "to"]
);
define_counter_vec!(
    PROMOTION_BLOCKED,
    "promotion_blocked_total",
    "Promotions refused, by reason",
    ["reason"]
);
define_histogram_vec!(
    TAKEOVER_DURATION,
    "takeover_duration_seconds",
    "Time from failure detection to serving as primary",
    ["trigger"],
    [0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
);

// =============================================================================
// Heartbeat metrics
// =============================================================================

define_gauge_vec!(
    PEER_STATE,
    "peer_state",
    "Peer health state (0=reachable, 1=suspected, 2=unreachable)",
    ["peer"]
);
define_counter_vec!(
    HEARTBEATS_SENT,
    "heartbeats_sent_total",
    "Heartbeats sent, by outcome",
    ["status"]
);
define_counter_vec!(
    HEARTBEATS_RECEIVED,
    "heartbeats_received_total",
    "Heartbeats received per peer",
    ["peer"]
);
define_counter_vec!(
    STALE_HEARTBEATS,
    "stale_heartbeats_total",
    "Heartbeats discarded for non-monotonic sequence numbers",
    ["peer"]
);

// =============================================================================
// Quorum metrics
// =============================================================================

define_gauge!(
    QUORUM_REACHABLE_VOTES,
    "quorum_reachable_votes",
    "Weighted votes currently reachable (including self)"
);
define_gauge!(
    QUORUM_HELD,
    "quorum_held",
    "Whether this node currently holds quorum (0 or 1)"
);
define_counter!(
    QUORUM_LOSSES,
    "quorum_losses_total",
    "Times quorum transitioned from held to lost"
);

// =============================================================================
// Replication metrics
// =============================================================================

define_counter_vec!(
    RECORDS_SENT,
    "records_sent_total",
    "Change records sent per peer",
    ["peer"]
);
define_counter_vec!(
    RECORDS_APPLIED,
    "records_applied_total",
    "Change records applied per origin",
    ["origin"]
);
define_counter_vec!(
    RECORDS_REJECTED,
    "records_rejected_total",
    "Change records rejected, by reason",
    ["origin", "reason"]
);
define_gauge_vec!(
    UNACKED_RECORDS,
    "unacked_records",
    "Records queued awaiting acknowledgment per peer",
    ["peer"]
);
define_gauge_vec!(
    REORDER_BUFFERED,
    "reorder_buffered",
    "Out-of-order records held in the reorder buffer per origin",
    ["origin"]
);

// =============================================================================
// Resync metrics
// =============================================================================

define_counter_vec!(
    RESYNCS,
    "resyncs_total",
    "Full snapshot resyncs, by trigger",
    ["trigger", "status"]
);
define_counter!(
    SNAPSHOT_CHECKSUM_FAILURES,
    "snapshot_checksum_failures_total",
    "Snapshots discarded due to checksum mismatch"
);
define_histogram_vec!(
    SNAPSHOT_SIZE,
    "snapshot_size_bytes",
    "Size of transferred snapshots in bytes",
    ["direction"],
    [1024.0, 16384.0, 131072.0, 1048576.0, 8388608.0, 16777216.0]
);

// =============================================================================
// Reconciliation metrics
// =============================================================================

define_counter_vec!(
    CONFLICTS,
    "conflicts_total",
    "Divergent writes detected during reconciliation",
    ["strategy", "outcome"]
);
define_gauge!(
    PENDING_CONFLICTS,
    "pending_conflicts",
    "Conflicts awaiting manual resolution"
);

// =============================================================================
// Virtual resource metrics
// =============================================================================

define_counter_vec!(
    RESOURCE_OPERATIONS,
    "resource_operations_total",
    "Virtual resource operations against the network backend",
    ["operation", "status"]
);
define_counter!(
    GRATUITOUS_ANNOUNCEMENTS,
    "gratuitous_announcements_total",
    "Gratuitous address announcements sent after takeover"
);

// =============================================================================
// Uplink metrics
// =============================================================================

define_gauge!(
    UPLINK_HEALTHY,
    "uplink_healthy",
    "Whether the uplink probe target is reachable (0 or 1)"
);
define_counter_vec!(
    UPLINK_PROBES,
    "uplink_probes_total",
    "Uplink reachability probes, by outcome",
    ["status"]
);

// =============================================================================
// Fencing metrics
// =============================================================================

define_counter_vec!(
    FENCING_EVENTS,
    "fencing_events_total",
    "Fencing decisions, by reason",
    ["reason"]
);
define_gauge!(
    FENCED_STATE,
    "fenced",
    "Whether this node is currently fenced (0 or 1)"
);

/// Retry attempts by policy and outcome.
///
/// Labels:
/// - `policy`: replication, resource, probe, fast
/// - `outcome`: attempt, success, exhausted
pub static RETRY_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_safe(
        &REGISTRY,
        "retry_attempts_total",
        "Retry attempts by policy and outcome",
        &["policy", "outcome"],
    )
});

// =============================================================================
// Connection metrics
// =============================================================================

define_gauge!(
    ACTIVE_PEER_CONNECTIONS,
    "active_peer_connections",
    "Number of active peer channel connections"
);
define_counter_vec!(
    PEER_CONNECTIONS,
    "peer_connections_total",
    "Peer connections accepted or dialed, by outcome",
    ["direction", "status"]
);
define_counter!(
    AUTH_FAILURES,
    "auth_failures_total",
    "Peer connections rejected during the shared-secret handshake"
);

// =============================================================================
// Registration helpers
// =============================================================================

/// Register an IntGauge safely, returning a fallback on error.
fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            // Return the gauge anyway - it just won't be in the registry
            gauge
        }
    }
}

/// Register an IntGaugeVec safely, returning a fallback on error.
fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
            gauge
        }
    }
}

/// Register an IntCounterVec safely, returning a fallback on error.
fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

/// Register an IntCounter safely, returning a fallback on error.
fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

/// Register a HistogramVec safely, returning a fallback on error.
fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(
        HistogramOpts::new(name, help).buckets(buckets.clone()),
        labels,
    )
    .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Initialize the metrics registry by touching every metric once.
///
/// This function is idempotent - it can be called multiple times safely.
/// Metrics are lazily initialized on first access.
pub fn init_metrics() {
    Lazy::force(&CURRENT_ROLE);
    Lazy::force(&CURRENT_EPOCH);
    Lazy::force(&ROLE_TRANSITIONS);
    Lazy::force(&PROMOTION_BLOCKED);
    Lazy::force(&TAKEOVER_DURATION);
    Lazy::force(&PEER_STATE);
    Lazy::force(&HEARTBEATS_SENT);
    Lazy::force(&HEARTBEATS_RECEIVED);
    Lazy::force(&STALE_HEARTBEATS);
    Lazy::force(&QUORUM_REACHABLE_VOTES);
    Lazy::force(&QUORUM_HELD);
    Lazy::force(&QUORUM_LOSSES);
    Lazy::force(&RECORDS_SENT);
    Lazy::force(&RECORDS_APPLIED);
    Lazy::force(&RECORDS_REJECTED);
    Lazy::force(&UNACKED_RECORDS);
    Lazy::force(&REORDER_BUFFERED);
    Lazy::force(&RESYNCS);
    Lazy::force(&SNAPSHOT_CHECKSUM_FAILURES);
    Lazy::force(&SNAPSHOT_SIZE);
    Lazy::force(&CONFLICTS);
    Lazy::force(&PENDING_CONFLICTS);
    Lazy::force(&RESOURCE_OPERATIONS);
    Lazy::force(&GRATUITOUS_ANNOUNCEMENTS);
    Lazy::force(&UPLINK_HEALTHY);
    Lazy::force(&UPLINK_PROBES);
    Lazy::force(&FENCING_EVENTS);
    Lazy::force(&FENCED_STATE);
    Lazy::force(&RETRY_ATTEMPTS);
    Lazy::force(&ACTIVE_PEER_CONNECTIONS);
    Lazy::force(&PEER_CONNECTIONS);
    Lazy::force(&AUTH_FAILURES);
}

/// Render all registered metrics in the Prometheus text exposition format.
pub fn render_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Gather all metric families from the registry.
pub fn gather_metrics() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

/// Record a role transition on the transition counter and role gauge.
pub fn record_role_transition(from: crate::types::Role, to: crate::types::Role) {
    ROLE_TRANSITIONS
        .with_label_values(&[&from.to_string(), &to.to_string()])
        .inc();
    CURRENT_ROLE.set(to.as_wire() as i64);
}

/// Record a fencing decision.
pub fn record_fencing(reason: &str) {
    FENCING_EVENTS.with_label_values(&[reason]).inc();
    FENCED_STATE.set(1);
}
