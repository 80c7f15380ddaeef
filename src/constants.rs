//! Default tunables and wire-protocol limits.
//!
//! Every value here can be overridden through [`crate::cluster::HaConfig`];
//! these are the defaults a two-node appliance cluster ships with.

/// Default interval between heartbeat transmissions.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Consecutive missed heartbeat intervals before a peer is declared unreachable.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Consecutive missed heartbeat intervals before a peer is suspected.
pub const DEFAULT_SUSPICION_THRESHOLD: u32 = 2;

/// Tolerance for heartbeat arrival jitter before an interval counts as missed.
pub const DEFAULT_JITTER_TOLERANCE_MS: u64 = 50;

/// Grace period after peer registration before missed heartbeats are counted.
pub const DEFAULT_STARTUP_GRACE_MS: u64 = 5_000;

/// Default TCP port for the peer coordination channel.
pub const DEFAULT_PEER_PORT: u16 = 5879;

/// Delay before an automatic failback demotes the standing primary.
pub const DEFAULT_FAILBACK_DELAY_MS: u64 = 30_000;

/// Interval between scheduled full resyncs.
pub const DEFAULT_RESYNC_INTERVAL_MS: u64 = 3_600_000;

/// Partitions longer than this force a full resync on recovery.
pub const DEFAULT_PARTITION_RESYNC_THRESHOLD_MS: u64 = 300_000;

/// Unacknowledged replication records beyond this depth trigger a full resync.
pub const DEFAULT_MAX_UNACKED_RECORDS: usize = 1_024;

/// Out-of-order records held per origin before a gap is declared.
pub const DEFAULT_REORDER_BUFFER_CAPACITY: usize = 1_024;

/// Gratuitous address announcements sent after a VIP assignment.
pub const DEFAULT_GARP_COUNT: u32 = 3;

/// Clock skew inside which last-writer-wins ordering is treated as ambiguous.
pub const DEFAULT_CLOCK_SKEW_TOLERANCE_MS: u64 = 5_000;

/// How long a manual conflict may stay pending before the default strategy applies.
pub const DEFAULT_MANUAL_CONFLICT_TIMEOUT_MS: u64 = 300_000;

/// Timeout for a single virtual-resource assign/release side effect.
pub const DEFAULT_RESOURCE_OP_TIMEOUT_MS: u64 = 5_000;

/// Consecutive uplink probe failures before the node considers itself isolated.
pub const DEFAULT_UPLINK_FAILURE_THRESHOLD: u32 = 3;

/// Interval between uplink reachability probes.
pub const DEFAULT_UPLINK_PROBE_INTERVAL_MS: u64 = 2_000;

/// Timeout for a single uplink probe connection attempt.
pub const DEFAULT_UPLINK_PROBE_TIMEOUT_MS: u64 = 1_500;

/// Grace period for draining replication acknowledgments on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

// ============================================================================
// Wire protocol limits
// ============================================================================

/// Maximum size of a single peer frame (resync snapshots included).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum length of a node id on the wire.
pub const MAX_NODE_ID_LEN: usize = 255;

/// Payloads below this size are never worth compressing.
pub const COMPRESSION_MIN_PAYLOAD: usize = 512;

/// Read timeout applied to the peer channel between frames.
pub const DEFAULT_FRAME_READ_TIMEOUT_MS: u64 = 30_000;
