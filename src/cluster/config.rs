//! Configuration for an HA coordination node.
//!
//! # Configuration Profiles
//!
//! Instead of tuning every field by hand, start from a validated profile:
//!
//! ```rust,no_run
//! use carpaccio::cluster::{HaConfig, HaProfile};
//!
//! // Development profile - relaxed timings for debugging
//! let dev_config = HaConfig::from_profile(HaProfile::Development);
//!
//! // Production profile - balanced safety and takeover speed
//! let prod_config = HaConfig::from_profile(HaProfile::Production);
//!
//! // Fast-failover profile - sub-second failure detection
//! let ff_config = HaConfig::from_profile(HaProfile::FastFailover);
//!
//! // Conservative profile - slow, flap-resistant detection
//! let cons_config = HaConfig::from_profile(HaProfile::Conservative);
//! ```

use std::time::Duration;

use crate::constants::{
    DEFAULT_CLOCK_SKEW_TOLERANCE_MS, DEFAULT_FAILBACK_DELAY_MS, DEFAULT_FAILURE_THRESHOLD,
    DEFAULT_FRAME_READ_TIMEOUT_MS, DEFAULT_GARP_COUNT, DEFAULT_HEARTBEAT_INTERVAL_MS,
    DEFAULT_JITTER_TOLERANCE_MS, DEFAULT_MANUAL_CONFLICT_TIMEOUT_MS, DEFAULT_MAX_UNACKED_RECORDS,
    DEFAULT_PARTITION_RESYNC_THRESHOLD_MS, DEFAULT_PEER_PORT, DEFAULT_REORDER_BUFFER_CAPACITY,
    DEFAULT_RESOURCE_OP_TIMEOUT_MS, DEFAULT_RESYNC_INTERVAL_MS, DEFAULT_SHUTDOWN_GRACE_MS,
    DEFAULT_STARTUP_GRACE_MS, DEFAULT_SUSPICION_THRESHOLD, DEFAULT_UPLINK_FAILURE_THRESHOLD,
    DEFAULT_UPLINK_PROBE_INTERVAL_MS, DEFAULT_UPLINK_PROBE_TIMEOUT_MS,
};
use crate::types::NodeId;

/// How quorum is evaluated before a node may hold or take the primary role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuorumMode {
    /// Strict majority of configured votes must be reachable.
    #[default]
    Majority,
    /// Like `Majority`, but each node contributes its configured weight.
    Weighted,
    /// Every configured vote must be reachable.
    Strict,
    /// Quorum is never evaluated (two-node clusters that accept the risk).
    None,
}

impl std::fmt::Display for QuorumMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuorumMode::Majority => write!(f, "majority"),
            QuorumMode::Weighted => write!(f, "weighted"),
            QuorumMode::Strict => write!(f, "strict"),
            QuorumMode::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for QuorumMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "majority" => Ok(QuorumMode::Majority),
            "weighted" => Ok(QuorumMode::Weighted),
            "strict" => Ok(QuorumMode::Strict),
            "none" => Ok(QuorumMode::None),
            _ => Err(format!(
                "Unknown quorum mode '{}'. Valid modes: majority, weighted, strict, none",
                s
            )),
        }
    }
}

/// What happens when a higher-priority node returns while a lower-priority
/// node is serving as primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailbackMode {
    /// Fail back automatically once the returning node has been stable for
    /// the configured delay.
    #[default]
    Auto,
    /// Record that failback is possible, but wait for an operator command.
    Manual,
    /// Never fail back; the current primary keeps serving.
    Never,
}

impl std::fmt::Display for FailbackMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailbackMode::Auto => write!(f, "auto"),
            FailbackMode::Manual => write!(f, "manual"),
            FailbackMode::Never => write!(f, "never"),
        }
    }
}

impl std::str::FromStr for FailbackMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(FailbackMode::Auto),
            "manual" => Ok(FailbackMode::Manual),
            "never" => Ok(FailbackMode::Never),
            _ => Err(format!(
                "Unknown failback mode '{}'. Valid modes: auto, manual, never",
                s
            )),
        }
    }
}

/// How divergent writes are resolved after a partition heals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcileStrategy {
    /// The write with the newer timestamp wins (within skew tolerance).
    #[default]
    Timestamp,
    /// The write from the higher-priority node wins.
    Priority,
    /// Conflicts are queued for operator resolution.
    Manual,
}

impl ReconcileStrategy {
    /// Stable label, used for metrics.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ReconcileStrategy::Timestamp => "timestamp",
            ReconcileStrategy::Priority => "priority",
            ReconcileStrategy::Manual => "manual",
        }
    }
}

impl std::fmt::Display for ReconcileStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReconcileStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "timestamp" => Ok(ReconcileStrategy::Timestamp),
            "priority" => Ok(ReconcileStrategy::Priority),
            "manual" => Ok(ReconcileStrategy::Manual),
            _ => Err(format!(
                "Unknown reconcile strategy '{}'. Valid strategies: timestamp, priority, manual",
                s
            )),
        }
    }
}

/// Validated configuration profiles that reduce cognitive load and prevent
/// misconfiguration.
///
/// | Profile | Use Case | Detection | Failback |
/// |---------|----------|-----------|----------|
/// | Development | Local testing | Slow | Auto, short delay |
/// | Production | Edge appliances | ~3s | Auto, 30s delay |
/// | FastFailover | Latency-sensitive gateways | ~1s | Auto, 10s delay |
/// | Conservative | Flaky links, WAN pairs | ~10s | Manual |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaProfile {
    /// Optimized for local development and testing.
    ///
    /// Relaxed timings so a debugger pause does not trigger a takeover.
    /// **Not suitable for production use.**
    Development,

    /// Balanced configuration for production appliance pairs.
    ///
    /// This is the recommended profile for most deployments.
    Production,

    /// Optimized for minimum takeover latency.
    ///
    /// **Warning:** tighter detection margins. Ensure the sync link is
    /// a dedicated, reliable interface.
    FastFailover,

    /// Optimized for unreliable links (WAN pairs, congested networks).
    ///
    /// Slow detection, manual failback, generous jitter tolerance.
    Conservative,
}

impl HaProfile {
    /// Get a human-readable description of the profile.
    pub fn description(&self) -> &'static str {
        match self {
            HaProfile::Development => "Local development and testing",
            HaProfile::Production => "Balanced production appliance pairs",
            HaProfile::FastFailover => "Minimum takeover latency",
            HaProfile::Conservative => "Flap-resistant detection for unreliable links",
        }
    }

    /// Get all available profiles.
    pub fn all() -> &'static [HaProfile] {
        &[
            HaProfile::Development,
            HaProfile::Production,
            HaProfile::FastFailover,
            HaProfile::Conservative,
        ]
    }
}

impl std::fmt::Display for HaProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaProfile::Development => write!(f, "development"),
            HaProfile::Production => write!(f, "production"),
            HaProfile::FastFailover => write!(f, "fast-failover"),
            HaProfile::Conservative => write!(f, "conservative"),
        }
    }
}

impl std::str::FromStr for HaProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(HaProfile::Development),
            "production" | "prod" => Ok(HaProfile::Production),
            "fast-failover" | "fast" | "ff" => Ok(HaProfile::FastFailover),
            "conservative" | "slow" => Ok(HaProfile::Conservative),
            _ => Err(format!(
                "Unknown profile '{}'. Valid profiles: development, production, fast-failover, conservative",
                s
            )),
        }
    }
}

/// Static description of one peer node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// The peer's unique node ID.
    pub id: NodeId,
    /// Address of the peer's coordination listener ("host:port").
    pub addr: String,
    /// Election priority. Lower values are preferred for the primary role.
    pub priority: u16,
    /// Quorum weight (used only in `QuorumMode::Weighted`).
    pub weight: u32,
    /// Witness nodes vote in quorum but are never eligible for primary.
    pub witness: bool,
}

impl PeerConfig {
    /// Parse one peer entry of the form `id=host:port:priority:weight[:witness]`.
    pub fn parse(entry: &str) -> Result<Self, String> {
        let (id, rest) = entry
            .split_once('=')
            .ok_or_else(|| format!("Peer entry '{}' missing 'id=' prefix", entry))?;
        if id.is_empty() {
            return Err(format!("Peer entry '{}' has an empty node id", entry));
        }

        let parts: Vec<&str> = rest.split(':').collect();
        if parts.len() < 4 {
            return Err(format!(
                "Peer entry '{}' must be id=host:port:priority:weight[:witness]",
                entry
            ));
        }

        let host = parts[0];
        let port: u16 = parts[1]
            .parse()
            .map_err(|_| format!("Invalid port '{}' in peer entry '{}'", parts[1], entry))?;
        let priority: u16 = parts[2]
            .parse()
            .map_err(|_| format!("Invalid priority '{}' in peer entry '{}'", parts[2], entry))?;
        let weight: u32 = parts[3]
            .parse()
            .map_err(|_| format!("Invalid weight '{}' in peer entry '{}'", parts[3], entry))?;
        let witness = match parts.get(4) {
            None => false,
            Some(&"witness") => true,
            Some(other) => {
                return Err(format!(
                    "Unexpected suffix '{}' in peer entry '{}' (only 'witness' is allowed)",
                    other, entry
                ));
            }
        };

        Ok(PeerConfig {
            id: NodeId::from(id),
            addr: format!("{}:{}", host, port),
            priority,
            weight,
            witness,
        })
    }
}

/// One virtual resource (shared address plus its announcement parameters)
/// that follows the primary role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualResourceConfig {
    /// The shared address, e.g. "192.0.2.1/24".
    pub address: String,
    /// Interface the address is assigned on.
    pub interface: String,
    /// Optional shared virtual MAC so switches never relearn on takeover.
    pub virtual_mac: Option<String>,
    /// Number of gratuitous announcements to send after assignment.
    pub announcement_count: u32,
}

impl VirtualResourceConfig {
    /// Parse one resource entry of the form `address@interface[@vmac]`.
    pub fn parse(entry: &str) -> Result<Self, String> {
        let mut parts = entry.split('@');
        let address = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("Resource entry '{}' missing address", entry))?;
        let interface = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("Resource entry '{}' missing interface", entry))?;
        let virtual_mac = parts.next().map(|s| s.to_string());

        Ok(VirtualResourceConfig {
            address: address.to_string(),
            interface: interface.to_string(),
            virtual_mac,
            announcement_count: DEFAULT_GARP_COUNT,
        })
    }
}

/// Configuration for an HA coordination node.
///
/// # Clock Synchronization Requirements
///
/// Timestamp-based conflict resolution relies on synchronized clocks across
/// both nodes. Run NTP (chrony or equivalent) on every appliance and keep
/// drift under the configured `clock_skew_tolerance`; writes whose timestamps
/// differ by less than the tolerance fall back to the priority tie-break.
#[derive(Debug, Clone)]
pub struct HaConfig {
    /// This node's unique ID.
    ///
    /// The node ID must be persistent and stable across restarts; it is
    /// the identity under which change records are sequenced, and a new ID
    /// after a restart would orphan the peer's highwater tracking.
    pub node_id: NodeId,

    /// Address to bind the coordination listener to ("host:port").
    pub listen_addr: String,

    /// Cluster shared secret for the peer handshake.
    pub shared_secret: String,

    /// This node's election priority. Lower values are preferred.
    pub priority: u16,

    /// This node's quorum weight (used only in `QuorumMode::Weighted`).
    pub weight: u32,

    /// Whether this node is a witness (votes, never serves).
    pub witness: bool,

    /// The other nodes in the cluster.
    pub peers: Vec<PeerConfig>,

    // --- Failure detection ---
    /// Interval between heartbeats to each peer.
    pub heartbeat_interval: Duration,

    /// Consecutive missed intervals before a peer is Suspected.
    pub suspicion_threshold: u32,

    /// Consecutive missed intervals before a peer is Unreachable.
    pub failure_threshold: u32,

    /// Extra slack added to each interval before it counts as missed.
    pub jitter_tolerance: Duration,

    /// Grace period after startup during which peers are never marked failed.
    pub startup_grace: Duration,

    // --- Arbitration ---
    /// How quorum is evaluated.
    pub quorum_mode: QuorumMode,

    /// What happens when a higher-priority node returns.
    pub failback_mode: FailbackMode,

    /// How long the returning node must be stable before auto failback.
    pub failback_delay: Duration,

    // --- Replication ---
    /// Maximum records queued per peer awaiting acknowledgment.
    pub max_unacked_records: usize,

    /// Capacity of the per-origin reorder buffer.
    pub reorder_buffer_capacity: usize,

    /// Whether to snappy-compress large frames on the peer channel.
    pub compression: bool,

    /// Read timeout on the peer channel before a connection is recycled.
    pub frame_read_timeout: Duration,

    // --- Resync ---
    /// Interval between periodic anti-entropy resyncs. Zero disables them.
    pub resync_interval: Duration,

    /// Partitions longer than this trigger a full resync on heal instead of
    /// replaying buffered records.
    pub partition_resync_threshold: Duration,

    // --- Reconciliation ---
    /// How divergent writes are resolved.
    pub reconcile_strategy: ReconcileStrategy,

    /// Timestamps closer than this are treated as concurrent.
    pub clock_skew_tolerance: Duration,

    /// How long manual conflicts wait before the timestamp fallback applies.
    pub manual_conflict_timeout: Duration,

    // --- Virtual resources ---
    /// Shared addresses that follow the primary role.
    pub virtual_resources: Vec<VirtualResourceConfig>,

    /// Timeout for one operation against the network backend.
    pub resource_op_timeout: Duration,

    // --- Uplink probing ---
    /// Probe target ("host:port"); `None` disables uplink probing.
    pub uplink_probe_target: Option<String>,

    /// Interval between uplink probes.
    pub uplink_probe_interval: Duration,

    /// Timeout for one uplink probe.
    pub uplink_probe_timeout: Duration,

    /// Consecutive probe failures before the uplink is declared down.
    pub uplink_failure_threshold: u32,

    // --- Lifecycle ---
    /// Grace period for draining on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::from("node-0"),
            listen_addr: format!("0.0.0.0:{}", DEFAULT_PEER_PORT),
            shared_secret: String::new(),
            priority: 100,
            weight: 1,
            witness: false,
            peers: Vec::new(),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            suspicion_threshold: DEFAULT_SUSPICION_THRESHOLD,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            jitter_tolerance: Duration::from_millis(DEFAULT_JITTER_TOLERANCE_MS),
            startup_grace: Duration::from_millis(DEFAULT_STARTUP_GRACE_MS),
            quorum_mode: QuorumMode::Majority,
            failback_mode: FailbackMode::Auto,
            failback_delay: Duration::from_millis(DEFAULT_FAILBACK_DELAY_MS),
            max_unacked_records: DEFAULT_MAX_UNACKED_RECORDS,
            reorder_buffer_capacity: DEFAULT_REORDER_BUFFER_CAPACITY,
            compression: true,
            frame_read_timeout: Duration::from_millis(DEFAULT_FRAME_READ_TIMEOUT_MS),
            resync_interval: Duration::from_millis(DEFAULT_RESYNC_INTERVAL_MS),
            partition_resync_threshold: Duration::from_millis(
                DEFAULT_PARTITION_RESYNC_THRESHOLD_MS,
            ),
            reconcile_strategy: ReconcileStrategy::Timestamp,
            clock_skew_tolerance: Duration::from_millis(DEFAULT_CLOCK_SKEW_TOLERANCE_MS),
            manual_conflict_timeout: Duration::from_millis(DEFAULT_MANUAL_CONFLICT_TIMEOUT_MS),
            virtual_resources: Vec::new(),
            resource_op_timeout: Duration::from_millis(DEFAULT_RESOURCE_OP_TIMEOUT_MS),
            uplink_probe_target: None,
            uplink_probe_interval: Duration::from_millis(DEFAULT_UPLINK_PROBE_INTERVAL_MS),
            uplink_probe_timeout: Duration::from_millis(DEFAULT_UPLINK_PROBE_TIMEOUT_MS),
            uplink_failure_threshold: DEFAULT_UPLINK_FAILURE_THRESHOLD,
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }
}

impl HaConfig {
    /// Create a validated configuration from a profile.
    pub fn from_profile(profile: HaProfile) -> Self {
        let base = Self::default();

        match profile {
            HaProfile::Development => Self {
                // Relaxed timings so a debugger pause does not kill a peer
                heartbeat_interval: Duration::from_secs(5),
                suspicion_threshold: 3,
                failure_threshold: 6,
                jitter_tolerance: Duration::from_millis(500),
                startup_grace: Duration::from_secs(10),

                failback_delay: Duration::from_secs(5),
                resync_interval: Duration::from_secs(60),
                quorum_mode: QuorumMode::None,
                ..base
            },
            HaProfile::Production => Self {
                heartbeat_interval: Duration::from_millis(1000),
                suspicion_threshold: 2,
                failure_threshold: 3,
                jitter_tolerance: Duration::from_millis(50),

                failback_delay: Duration::from_secs(30),
                ..base
            },
            HaProfile::FastFailover => Self {
                // Sub-second detection; needs a dedicated sync link
                heartbeat_interval: Duration::from_millis(250),
                suspicion_threshold: 2,
                failure_threshold: 3,
                jitter_tolerance: Duration::from_millis(25),
                startup_grace: Duration::from_secs(3),

                failback_delay: Duration::from_secs(10),
                ..base
            },
            HaProfile::Conservative => Self {
                heartbeat_interval: Duration::from_secs(2),
                suspicion_threshold: 3,
                failure_threshold: 5,
                jitter_tolerance: Duration::from_millis(400),
                startup_grace: Duration::from_secs(15),

                failback_mode: FailbackMode::Manual,
                failback_delay: Duration::from_secs(120),
                ..base
            },
        }
    }

    /// Create configuration from the `HA_PROFILE` environment variable,
    /// defaulting to `Production`.
    pub fn from_profile_env() -> Self {
        let profile = std::env::var("HA_PROFILE")
            .ok()
            .and_then(|s| s.parse::<HaProfile>().ok())
            .unwrap_or(HaProfile::Production);

        eprintln!("Using HA profile: {} ({})", profile, profile.description());
        Self::from_profile(profile)
    }

    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `NODE_ID`: This node's ID (required)
    /// - `LISTEN_ADDR`: Coordination listener address (default: 0.0.0.0:5879)
    /// - `HA_SECRET`: Cluster shared secret (required)
    /// - `HA_PRIORITY`: Election priority, lower preferred (default: 100)
    /// - `HA_WEIGHT`: Quorum weight (default: 1)
    /// - `HA_WITNESS`: "true" to make this node a witness (default: false)
    /// - `HA_PEERS`: Comma-separated `id=host:port:priority:weight[:witness]`
    /// - `HA_PROFILE`: Base profile to start from (default: production)
    /// - `QUORUM_MODE`: majority, weighted, strict, or none
    /// - `FAILBACK_MODE`: auto, manual, or never
    /// - `FAILBACK_DELAY_MS`, `HEARTBEAT_INTERVAL_MS`: timing overrides
    /// - `RECONCILE_STRATEGY`: timestamp, priority, or manual
    /// - `VIRTUAL_RESOURCES`: Comma-separated `address@interface[@vmac]`
    /// - `UPLINK_PROBE_TARGET`: "host:port" to enable uplink probing
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::from_profile_env();

        let node_id = std::env::var("NODE_ID").map_err(|_| "NODE_ID must be set")?;
        if node_id.is_empty() {
            return Err("NODE_ID must not be empty".into());
        }
        config.node_id = NodeId::from(node_id);

        if let Ok(addr) = std::env::var("LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        config.shared_secret = std::env::var("HA_SECRET").map_err(|_| "HA_SECRET must be set")?;

        if let Ok(priority) = std::env::var("HA_PRIORITY") {
            config.priority = priority
                .parse()
                .map_err(|e| format!("Invalid HA_PRIORITY: {}", e))?;
        }

        if let Ok(weight) = std::env::var("HA_WEIGHT") {
            config.weight = weight
                .parse()
                .map_err(|e| format!("Invalid HA_WEIGHT: {}", e))?;
        }

        if let Ok(witness) = std::env::var("HA_WITNESS") {
            config.witness = witness.eq_ignore_ascii_case("true");
        }

        if let Ok(peers) = std::env::var("HA_PEERS") {
            config.peers = peers
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|entry| PeerConfig::parse(entry.trim()))
                .collect::<Result<Vec<_>, _>>()?;
        }

        if let Ok(mode) = std::env::var("QUORUM_MODE") {
            config.quorum_mode = mode.parse()?;
        }

        if let Ok(mode) = std::env::var("FAILBACK_MODE") {
            config.failback_mode = mode.parse()?;
        }

        if let Ok(delay) = std::env::var("FAILBACK_DELAY_MS") {
            let ms: u64 = delay
                .parse()
                .map_err(|e| format!("Invalid FAILBACK_DELAY_MS: {}", e))?;
            config.failback_delay = Duration::from_millis(ms);
        }

        if let Ok(interval) = std::env::var("HEARTBEAT_INTERVAL_MS") {
            let ms: u64 = interval
                .parse()
                .map_err(|e| format!("Invalid HEARTBEAT_INTERVAL_MS: {}", e))?;
            config.heartbeat_interval = Duration::from_millis(ms);
        }

        if let Ok(strategy) = std::env::var("RECONCILE_STRATEGY") {
            config.reconcile_strategy = strategy.parse()?;
        }

        if let Ok(resources) = std::env::var("VIRTUAL_RESOURCES") {
            config.virtual_resources = resources
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|entry| VirtualResourceConfig::parse(entry.trim()))
                .collect::<Result<Vec<_>, _>>()?;
        }

        if let Ok(target) = std::env::var("UPLINK_PROBE_TARGET") {
            if !target.is_empty() {
                config.uplink_probe_target = Some(target);
            }
        }

        config
            .validate()
            .map_err(|errors| format!("Invalid configuration: {}", errors.join("; ")))?;

        Ok(config)
    }

    /// Total number of voting nodes (peers plus self).
    pub fn total_votes(&self) -> u32 {
        self.peers.len() as u32 + 1
    }

    /// Validate the configuration and return any errors found.
    ///
    /// This should be called at startup to catch configuration issues early.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.node_id.as_str().is_empty() {
            errors.push("node_id must not be empty".to_string());
        }

        if self.shared_secret.is_empty() {
            errors.push("shared_secret must not be empty".to_string());
        }

        // Thresholds: suspicion must come before failure
        if self.suspicion_threshold >= self.failure_threshold {
            errors.push(format!(
                "suspicion_threshold ({}) must be less than failure_threshold ({})",
                self.suspicion_threshold, self.failure_threshold
            ));
        }

        if self.heartbeat_interval.is_zero() {
            errors.push("heartbeat_interval must be greater than zero".to_string());
        }

        // Jitter slack must not swallow whole intervals
        if self.jitter_tolerance >= self.heartbeat_interval {
            errors.push(format!(
                "jitter_tolerance ({:?}) must be less than heartbeat_interval ({:?})",
                self.jitter_tolerance, self.heartbeat_interval
            ));
        }

        if self.peers.iter().any(|p| p.id == self.node_id) {
            errors.push(format!(
                "peers must not include this node's own id ({})",
                self.node_id
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for peer in &self.peers {
            if !seen.insert(&peer.id) {
                errors.push(format!("duplicate peer id: {}", peer.id));
            }
        }

        // A witness cannot be the only serving-eligible node
        if self.witness && self.peers.iter().all(|p| p.witness) {
            errors.push("at least one node must be eligible for the primary role".to_string());
        }

        if self.quorum_mode == QuorumMode::Strict && self.peers.is_empty() {
            errors.push("strict quorum requires at least one peer".to_string());
        }

        if self.reorder_buffer_capacity == 0 {
            errors.push("reorder_buffer_capacity must be greater than zero".to_string());
        }

        if self.max_unacked_records == 0 {
            errors.push("max_unacked_records must be greater than zero".to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Validate and panic with a readable report on failure.
    pub fn validate_or_panic(&self) {
        if let Err(errors) = self.validate() {
            eprintln!("=== Configuration Validation Failed ===");
            for (i, error) in errors.iter().enumerate() {
                eprintln!("  {}. {}", i + 1, error);
            }
            eprintln!("========================================");
            panic!("Invalid configuration - {} error(s) found", errors.len());
        }
    }
}
