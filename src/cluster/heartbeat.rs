//! Heartbeat-based failure detection for peer nodes.
//!
//! Each node sends periodic heartbeats to every peer over the coordination
//! channel. The tracker on the receiving side watches arrival times and
//! drives each peer through:
//!
//! 1. **Reachable** - Heartbeats received on time
//! 2. **Suspected** - Some intervals missed (potential network blip)
//! 3. **Unreachable** - Enough intervals missed to declare failure
//!
//! The suspected state exists to reduce false positives from transient
//! network issues: a peer that recovers from Suspected never triggers a
//! role transition.
//!
//! Heartbeats carry a monotonically increasing sequence number. A heartbeat
//! whose sequence is not strictly greater than the last accepted one is
//! discarded, so delayed or duplicated datagrams can never make a dead peer
//! look alive.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::config::HaConfig;
use super::metrics;
use crate::types::{Epoch, NodeId, Role, Sequence};

/// Configuration for the peer tracker.
#[derive(Debug, Clone)]
pub struct PeerTrackerConfig {
    /// How often peers send heartbeats.
    pub heartbeat_interval: Duration,

    /// Number of missed intervals before a peer is Suspected.
    pub suspicion_threshold: u32,

    /// Number of missed intervals before a peer is Unreachable.
    pub failure_threshold: u32,

    /// How often to run the check loop.
    /// Default: half the heartbeat interval.
    pub check_interval: Duration,

    /// Jitter tolerance buffer for heartbeat timing.
    ///
    /// Heartbeats arriving within this tolerance of the expected time are
    /// not counted as missed. This prevents false positives due to network
    /// jitter and OS scheduling delays.
    pub jitter_tolerance: Duration,

    /// Startup grace period before enforcing failure detection.
    ///
    /// When a peer is first registered, allow this much time before
    /// counting missed intervals. This prevents marking peers as failed
    /// while they are still initializing.
    pub startup_grace: Duration,
}

impl Default for PeerTrackerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(1000),
            suspicion_threshold: 2,
            failure_threshold: 3,
            check_interval: Duration::from_millis(500),
            jitter_tolerance: Duration::from_millis(50),
            startup_grace: Duration::from_secs(5),
        }
    }
}

impl PeerTrackerConfig {
    /// Derive tracker settings from the node configuration.
    pub fn from_ha_config(config: &HaConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            suspicion_threshold: config.suspicion_threshold,
            failure_threshold: config.failure_threshold,
            check_interval: config.heartbeat_interval / 2,
            jitter_tolerance: config.jitter_tolerance,
            startup_grace: config.startup_grace,
        }
    }

    /// Time from last heartbeat to an Unreachable declaration.
    pub fn detection_time(&self) -> Duration {
        self.heartbeat_interval * self.failure_threshold
    }

    /// Time from last heartbeat to a Suspected declaration.
    pub fn suspicion_time(&self) -> Duration {
        self.heartbeat_interval * self.suspicion_threshold
    }
}

/// Health state of a peer from the tracker's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerHealthState {
    /// Heartbeats received on time.
    Reachable,
    /// Some intervals missed; failure not yet declared.
    Suspected,
    /// Enough intervals missed to declare failure.
    Unreachable,
}

impl PeerHealthState {
    fn as_gauge_value(&self) -> i64 {
        match self {
            PeerHealthState::Reachable => 0,
            PeerHealthState::Suspected => 1,
            PeerHealthState::Unreachable => 2,
        }
    }
}

impl std::fmt::Display for PeerHealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerHealthState::Reachable => write!(f, "reachable"),
            PeerHealthState::Suspected => write!(f, "suspected"),
            PeerHealthState::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Outcome of offering a heartbeat to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The heartbeat advanced the peer's state.
    Accepted,
    /// The sequence was not strictly greater than the last accepted one.
    Stale,
}

/// Health tracking for a single peer.
#[derive(Debug)]
struct PeerHealth {
    /// Time of last accepted heartbeat.
    last_heartbeat: Instant,
    /// Highest heartbeat sequence accepted so far.
    last_sequence: Option<Sequence>,
    /// Role the peer last advertised.
    advertised_role: Role,
    /// Epoch the peer last advertised.
    advertised_epoch: Epoch,
    /// Number of consecutive missed intervals.
    missed_count: u32,
    /// Current health state.
    state: PeerHealthState,
    /// When the peer was registered with this tracker.
    registered_at: Instant,
}

impl PeerHealth {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            last_heartbeat: now,
            last_sequence: None,
            advertised_role: Role::Init,
            advertised_epoch: Epoch::new(0),
            missed_count: 0,
            state: PeerHealthState::Reachable,
            registered_at: now,
        }
    }
}

/// Event emitted when a peer's health state changes.
#[derive(Debug, Clone)]
pub struct PeerStateChange {
    pub peer: NodeId,
    pub previous_state: PeerHealthState,
    pub new_state: PeerHealthState,
    pub missed_intervals: u32,
    pub time_since_last_heartbeat: Duration,
    /// Role the peer last advertised before the change.
    pub advertised_role: Role,
}

/// Heartbeat tracker for all configured peers.
///
/// The tracker is shared between the connection tasks (which record
/// heartbeats) and the check loop on the control plane (which emits state
/// changes into the arbiter).
pub struct PeerTracker {
    config: PeerTrackerConfig,
    /// Per-peer health tracking.
    peers: DashMap<NodeId, PeerHealth>,
    /// Counter for total failures detected (for metrics).
    failures_detected: AtomicU64,
    /// Counter for false positives (peer recovered from Suspected).
    false_positives_avoided: AtomicU64,
}

impl PeerTracker {
    /// Create a new tracker with the given configuration.
    pub fn new(config: PeerTrackerConfig) -> Self {
        info!(
            heartbeat_interval_ms = config.heartbeat_interval.as_millis(),
            suspicion_threshold = config.suspicion_threshold,
            failure_threshold = config.failure_threshold,
            detection_time_ms = config.detection_time().as_millis(),
            "Creating peer tracker"
        );

        Self {
            config,
            peers: DashMap::new(),
            failures_detected: AtomicU64::new(0),
            false_positives_avoided: AtomicU64::new(0),
        }
    }

    /// Create a tracker with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(PeerTrackerConfig::default())
    }

    /// Get the configuration.
    pub fn config(&self) -> &PeerTrackerConfig {
        &self.config
    }

    /// Register a peer for health tracking.
    pub fn register_peer(&self, peer: NodeId) {
        info!(peer = %peer, "Registering peer for failure detection");
        self.peers.insert(peer, PeerHealth::new());
    }

    /// Unregister a peer (graceful departure).
    pub fn unregister_peer(&self, peer: &NodeId) {
        info!(peer = %peer, "Unregistering peer from failure detection");
        self.peers.remove(peer);
    }

    /// Record a heartbeat from a peer.
    ///
    /// Returns [`HeartbeatOutcome::Stale`] and leaves all state untouched
    /// when the sequence does not advance past the last accepted one.
    pub fn record_heartbeat(
        &self,
        peer: &NodeId,
        sequence: Sequence,
        role: Role,
        epoch: Epoch,
    ) -> HeartbeatOutcome {
        let now = Instant::now();

        let mut entry = self
            .peers
            .entry(peer.clone())
            .or_insert_with(|| {
                debug!(peer = %peer, "First heartbeat from unregistered peer");
                PeerHealth::new()
            });
        let health = entry.value_mut();

        if let Some(last) = health.last_sequence {
            if sequence <= last {
                drop(entry);
                warn!(
                    peer = %peer,
                    sequence = sequence.value(),
                    last_accepted = last.value(),
                    "Discarding stale heartbeat"
                );
                metrics::STALE_HEARTBEATS
                    .with_label_values(&[peer.as_str()])
                    .inc();
                return HeartbeatOutcome::Stale;
            }
        }

        let was_suspected = health.state == PeerHealthState::Suspected;
        health.last_heartbeat = now;
        health.last_sequence = Some(sequence);
        health.advertised_role = role;
        health.advertised_epoch = epoch;
        health.missed_count = 0;
        health.state = PeerHealthState::Reachable;

        if was_suspected {
            debug!(peer = %peer, "Peer recovered from suspected state");
            self.false_positives_avoided.fetch_add(1, Ordering::Relaxed);
        }
        drop(entry);

        metrics::HEARTBEATS_RECEIVED
            .with_label_values(&[peer.as_str()])
            .inc();
        metrics::PEER_STATE
            .with_label_values(&[peer.as_str()])
            .set(PeerHealthState::Reachable.as_gauge_value());

        HeartbeatOutcome::Accepted
    }

    /// Check all peers and return any state transitions.
    ///
    /// This should be called periodically (every `check_interval`) by a
    /// control-plane task; the returned changes feed the role arbiter.
    pub fn check_peers(&self) -> Vec<PeerStateChange> {
        let now = Instant::now();
        let mut state_changes = Vec::new();

        for mut entry in self.peers.iter_mut() {
            let peer = entry.key().clone();
            let health = entry.value_mut();

            // Apply startup grace period
            let time_since_registration = now.duration_since(health.registered_at);
            if time_since_registration < self.config.startup_grace {
                debug!(
                    peer = %peer,
                    remaining_grace_ms =
                        (self.config.startup_grace - time_since_registration).as_millis(),
                    "Peer in startup grace period, skipping failure check"
                );
                continue;
            }

            let elapsed = now.duration_since(health.last_heartbeat);

            // Subtract jitter tolerance before counting missed intervals
            let effective_elapsed = elapsed.saturating_sub(self.config.jitter_tolerance);
            let missed = if self.config.heartbeat_interval.as_nanos() > 0 {
                (effective_elapsed.as_nanos() / self.config.heartbeat_interval.as_nanos()) as u32
            } else {
                0
            };
            health.missed_count = missed;

            let previous_state = health.state;
            let new_state = if missed >= self.config.failure_threshold {
                PeerHealthState::Unreachable
            } else if missed >= self.config.suspicion_threshold {
                PeerHealthState::Suspected
            } else {
                PeerHealthState::Reachable
            };

            if new_state != previous_state {
                health.state = new_state;

                let change = PeerStateChange {
                    peer: peer.clone(),
                    previous_state,
                    new_state,
                    missed_intervals: missed,
                    time_since_last_heartbeat: elapsed,
                    advertised_role: health.advertised_role,
                };

                match new_state {
                    PeerHealthState::Unreachable => {
                        warn!(
                            peer = %peer,
                            missed_intervals = missed,
                            time_since_last_heartbeat_ms = elapsed.as_millis(),
                            "Peer declared UNREACHABLE"
                        );
                        self.failures_detected.fetch_add(1, Ordering::Relaxed);
                    }
                    PeerHealthState::Suspected => {
                        info!(
                            peer = %peer,
                            missed_intervals = missed,
                            time_since_last_heartbeat_ms = elapsed.as_millis(),
                            "Peer suspected of failure"
                        );
                    }
                    PeerHealthState::Reachable => {
                        debug!(peer = %peer, "Peer returned to reachable state");
                    }
                }

                metrics::PEER_STATE
                    .with_label_values(&[peer.as_str()])
                    .set(new_state.as_gauge_value());
                state_changes.push(change);
            }
        }

        state_changes
    }

    /// Get the current health state of a peer.
    pub fn peer_state(&self, peer: &NodeId) -> Option<PeerHealthState> {
        self.peers.get(peer).map(|h| h.state)
    }

    /// Get the role a peer last advertised.
    pub fn advertised_role(&self, peer: &NodeId) -> Option<Role> {
        self.peers.get(peer).map(|h| h.advertised_role)
    }

    /// Get the epoch a peer last advertised.
    pub fn advertised_epoch(&self, peer: &NodeId) -> Option<Epoch> {
        self.peers.get(peer).map(|h| h.advertised_epoch)
    }

    /// Get all peers in a specific state.
    pub fn peers_in_state(&self, state: PeerHealthState) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|entry| entry.value().state == state)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of peers being tracked.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Number of peers currently reachable.
    pub fn reachable_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|entry| entry.value().state == PeerHealthState::Reachable)
            .count()
    }

    /// Total failures detected since creation.
    pub fn total_failures_detected(&self) -> u64 {
        self.failures_detected.load(Ordering::Relaxed)
    }

    /// Total false positives avoided (recovered from Suspected).
    pub fn total_false_positives_avoided(&self) -> u64 {
        self.false_positives_avoided.load(Ordering::Relaxed)
    }

    /// Check if a specific peer is reachable.
    pub fn is_reachable(&self, peer: &NodeId) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|h| h.state == PeerHealthState::Reachable)
    }

    /// Check if a specific peer is unreachable.
    pub fn is_unreachable(&self, peer: &NodeId) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|h| h.state == PeerHealthState::Unreachable)
    }

    /// Time since the last accepted heartbeat for a peer.
    pub fn time_since_heartbeat(&self, peer: &NodeId) -> Option<Duration> {
        self.peers
            .get(peer)
            .map(|h| Instant::now().duration_since(h.last_heartbeat))
    }
}

impl Default for PeerTracker {
    fn default() -> Self {
        Self::with_defaults()
    }
}
