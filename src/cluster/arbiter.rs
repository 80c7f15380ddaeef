//! Role arbitration: the single writer of role and epoch.
//!
//! Every input that can change what this node should be doing - peer
//! health transitions, quorum changes, uplink health, operator commands,
//! reconciliation completion - funnels into the arbiter as an [`HaEvent`].
//! The arbiter re-evaluates the decision procedure on each event and on a
//! periodic tick, and is the only place the node's [`Role`] and [`Epoch`]
//! are ever mutated. Everyone else observes them through a watch channel.
//!
//! # Decision procedure
//!
//! - A primary that loses quorum fences itself immediately.
//! - Two reachable primaries resolve by epoch first (the stale one steps
//!   down), then by priority: the node with the numerically larger
//!   priority value fences and reconciles.
//! - A backup promotes when it wins the election (lowest priority value
//!   among reachable non-witness, non-fenced nodes, node-id tie-break),
//!   quorum is held, no primary is visible, and its uplink is healthy.
//! - Promotion bumps the epoch past the highest epoch ever observed, so
//!   records from any earlier primacy are recognizably stale.
//! - With auto failback, a primary steps aside once a better-priority
//!   candidate has been stably reachable for the failback delay.
//!
//! Fencing for quorum loss or dual primary is only lifted by a
//! [`HaEvent::ReconciliationComplete`]; fencing for uplink loss or a
//! manual switchover lifts itself once the triggering condition clears.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::config::{FailbackMode, HaConfig};
use super::fencing::{FencedState, FencingAgent};
use super::heartbeat::{PeerHealthState, PeerStateChange};
use super::metrics;
use super::quorum::QuorumEvaluator;
use super::reachability::UplinkEvent;
use super::store::ReplicatedStore;
use super::view::ClusterView;
use super::virtual_ip::VirtualIdentityManager;
use crate::types::{Epoch, Role};

/// Inputs to the arbitration loop.
#[derive(Debug)]
pub enum HaEvent {
    PeerChanged(PeerStateChange),
    Uplink(UplinkEvent),
    /// Operator-requested switchover away from this node.
    ForceFailover,
    /// Post-partition reconciliation finished; safety fencing may lift.
    ReconciliationComplete,
    Shutdown,
}

/// Why the node is currently fenced. Determines how fencing lifts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceCause {
    /// Safety fence; lifts only after reconciliation.
    QuorumLost,
    /// Safety fence; lifts only after reconciliation.
    DualPrimary,
    /// Lifts once the uplink recovers.
    UplinkDown,
    /// Lifts once another node is observed serving.
    ManualFailover,
}

impl FenceCause {
    fn as_label(self) -> &'static str {
        match self {
            FenceCause::QuorumLost => "quorum_lost",
            FenceCause::DualPrimary => "dual_primary",
            FenceCause::UplinkDown => "uplink_down",
            FenceCause::ManualFailover => "manual_failover",
        }
    }

    /// Safety fences require reconciliation before lifting.
    fn is_safety(self) -> bool {
        matches!(self, FenceCause::QuorumLost | FenceCause::DualPrimary)
    }
}

/// The role/epoch pair published to observers, plus the most recent
/// quorum verdict so status readers need no evaluator of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleState {
    pub role: Role,
    pub epoch: Epoch,
    pub quorum_held: bool,
}

/// Sole owner and mutator of this node's role and epoch.
pub struct RoleArbiter {
    config: HaConfig,
    view: Arc<ClusterView>,
    quorum: QuorumEvaluator,
    fenced: Arc<FencedState>,
    fencing_agent: Arc<dyn FencingAgent>,
    resources: Arc<VirtualIdentityManager>,
    store: Arc<ReplicatedStore>,

    role: Role,
    epoch: Epoch,
    quorum_held: bool,
    fence_cause: Option<FenceCause>,
    /// When a better-priority candidate first became reachable, for the
    /// auto-failback delay.
    better_candidate_since: Option<Instant>,
    uplink_healthy: bool,

    role_tx: watch::Sender<RoleState>,
}

impl RoleArbiter {
    pub fn new(
        config: HaConfig,
        view: Arc<ClusterView>,
        fenced: Arc<FencedState>,
        fencing_agent: Arc<dyn FencingAgent>,
        resources: Arc<VirtualIdentityManager>,
        store: Arc<ReplicatedStore>,
    ) -> Self {
        let quorum = QuorumEvaluator::from_config(&config);
        let (role_tx, _) = watch::channel(RoleState {
            role: Role::Init,
            epoch: Epoch::default(),
            quorum_held: false,
        });

        Self {
            config,
            view,
            quorum,
            fenced,
            fencing_agent,
            resources,
            store,
            role: Role::Init,
            epoch: Epoch::default(),
            quorum_held: false,
            fence_cause: None,
            better_candidate_since: None,
            uplink_healthy: true,
            role_tx,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn is_fenced(&self) -> bool {
        self.fenced.is_active()
    }

    /// Observe role/epoch changes.
    pub fn subscribe(&self) -> watch::Receiver<RoleState> {
        self.role_tx.subscribe()
    }

    /// Event loop. Consumes the arbiter; runs until `Shutdown` or the
    /// event channel closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<HaEvent>) {
        let check_interval = self.config.heartbeat_interval / 2;
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            node = %self.config.node_id,
            priority = self.config.priority,
            quorum_mode = %self.config.quorum_mode,
            "Role arbiter started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for change in self.view.tracker().check_peers() {
                        self.note_peer_change(&change);
                    }
                    self.evaluate().await;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            if !self.handle_event(event).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // Leave the cluster cleanly: never exit while holding resources
        if self.resources.owns_resources() {
            self.resources.release_all().await;
        }
        info!(node = %self.config.node_id, "Role arbiter stopped");
    }

    /// Apply one event. Returns `false` when the loop should stop.
    pub async fn handle_event(&mut self, event: HaEvent) -> bool {
        match event {
            HaEvent::PeerChanged(change) => {
                self.note_peer_change(&change);
                self.evaluate().await;
            }
            HaEvent::Uplink(UplinkEvent::Down) => {
                self.uplink_healthy = false;
                self.evaluate().await;
            }
            HaEvent::Uplink(UplinkEvent::Up) => {
                self.uplink_healthy = true;
                self.evaluate().await;
            }
            HaEvent::ForceFailover => {
                if self.role == Role::Primary {
                    info!("Operator requested failover away from this node");
                    self.fence(FenceCause::ManualFailover).await;
                } else {
                    warn!(role = %self.role, "Ignoring failover request: not primary");
                }
                self.evaluate().await;
            }
            HaEvent::ReconciliationComplete => {
                self.on_reconciled().await;
                self.evaluate().await;
            }
            HaEvent::Shutdown => {
                if self.role == Role::Primary {
                    info!("Shutting down while primary, releasing resources");
                    self.resources.release_all().await;
                    self.transition(Role::Backup, self.epoch);
                }
                return false;
            }
        }
        true
    }

    fn note_peer_change(&self, change: &PeerStateChange) {
        info!(
            peer = %change.peer,
            from = %change.previous_state,
            to = %change.new_state,
            missed = change.missed_intervals,
            "Peer health changed"
        );
        if change.new_state == PeerHealthState::Unreachable
            && change.advertised_role == Role::Primary
        {
            warn!(peer = %change.peer, "Serving peer became unreachable");
        }
    }

    /// Run the decision procedure against the current cluster view.
    pub async fn evaluate(&mut self) {
        let decision = self.quorum.evaluate(&self.view.reachable_peers());
        if decision.held != self.quorum_held {
            self.quorum_held = decision.held;
            self.publish();
        }

        if self.fenced.is_active() {
            self.evaluate_fenced().await;
            return;
        }

        match self.role {
            Role::Primary => self.evaluate_as_primary(decision.held).await,
            Role::Init | Role::Backup => self.evaluate_as_standby(decision.held).await,
            Role::Fenced => {
                // Role says fenced but the flag cleared: reconciliation
                // finished elsewhere. Normalize to backup.
                self.transition(Role::Backup, self.epoch);
            }
        }
    }

    async fn evaluate_as_primary(&mut self, quorum_held: bool) {
        if !quorum_held {
            self.fence(FenceCause::QuorumLost).await;
            return;
        }

        // Dual-primary resolution after a partition heals
        if let Some(peer) = self.view.reachable_primary() {
            let peer_epoch = self
                .view
                .tracker()
                .advertised_epoch(&peer)
                .unwrap_or_default();
            if peer_epoch > self.epoch {
                // We are the stale primary from before the partition
                warn!(
                    peer = %peer,
                    peer_epoch = peer_epoch.value(),
                    local_epoch = self.epoch.value(),
                    "Newer primary observed, stepping down"
                );
                self.fence(FenceCause::DualPrimary).await;
                return;
            }
            if peer_epoch == self.epoch {
                let peer_info = self.view.member(&peer);
                let peer_rank = peer_info.map(|p| (p.priority, p.id.clone()));
                let local_rank = (self.config.priority, self.config.node_id.clone());
                if let Some(peer_rank) = peer_rank {
                    if local_rank > peer_rank {
                        warn!(
                            peer = %peer,
                            "Dual primary at equal epoch, yielding to preferred node"
                        );
                        self.fence(FenceCause::DualPrimary).await;
                        return;
                    }
                    // We win; reassert ownership on the wire
                    info!(peer = %peer, "Dual primary at equal epoch, keeping the role");
                    self.resources.reannounce().await;
                }
            }
            // peer_epoch < self.epoch: the peer is stale and will step
            // down on its own once it sees our heartbeats
        }

        // A primary whose uplink is dead is useless; hand over if anyone
        // can take over
        if !self.uplink_healthy && self.has_standby_candidate() {
            warn!("Uplink down with a standby available, fencing to hand over");
            self.fence(FenceCause::UplinkDown).await;
            return;
        }

        self.check_failback().await;
        self.update_degraded_flag();
    }

    async fn evaluate_as_standby(&mut self, quorum_held: bool) {
        // Standbys follow the highest epoch they can see. Adoption goes
        // through the transition path so heartbeats and status readers
        // pick up the new epoch from the watch.
        let observed = self.view.highest_advertised_epoch();
        if observed > self.epoch {
            debug!(epoch = observed.value(), "Adopting observed epoch");
            self.transition(self.role, observed);
        }

        self.store.set_degraded(false);

        let winner = match self.view.elect() {
            Some(winner) => winner,
            None => return,
        };
        if winner != self.config.node_id {
            // Initial arbitration resolved against us
            if self.role == Role::Init {
                self.transition(Role::Backup, self.epoch);
            }
            return;
        }

        if self.view.reachable_primary().is_some() {
            // A primary is serving; even if we are preferred, failback is
            // the primary's decision, not ours
            if self.role == Role::Init {
                self.transition(Role::Backup, self.epoch);
            }
            return;
        }
        if !quorum_held {
            debug!("Won election but quorum not held, promotion blocked");
            metrics::PROMOTION_BLOCKED
                .with_label_values(&["quorum"])
                .inc();
            return;
        }
        if !self.uplink_healthy {
            metrics::PROMOTION_BLOCKED
                .with_label_values(&["uplink"])
                .inc();
            return;
        }

        let trigger = if self.role == Role::Init {
            "startup"
        } else {
            "failover"
        };
        self.promote(trigger).await;
    }

    async fn evaluate_fenced(&mut self) {
        let cause = match self.fence_cause {
            Some(cause) => cause,
            None => return,
        };
        match cause {
            FenceCause::UplinkDown if self.uplink_healthy => {
                self.unfence("uplink_recovered");
            }
            FenceCause::ManualFailover if self.view.reachable_primary().is_some() => {
                self.unfence("handover_complete");
            }
            // Safety fences wait for ReconciliationComplete
            _ => {}
        }
    }

    async fn on_reconciled(&mut self) {
        match self.fence_cause {
            Some(cause) if cause.is_safety() => self.unfence("reconciled"),
            _ => debug!("Reconciliation completed outside a safety fence"),
        }
    }

    async fn promote(&mut self, trigger: &str) {
        let start = Instant::now();
        let new_epoch = self.epoch.max(self.view.highest_advertised_epoch()).next();

        info!(
            epoch = new_epoch.value(),
            trigger, "Promoting to primary"
        );
        Arc::clone(&self.resources).claim_all().await;
        if self.resources.is_degraded() {
            warn!("Promoted with outstanding virtual resource claims, serving degraded");
        }

        self.transition(Role::Primary, new_epoch);
        self.update_degraded_flag();
        metrics::TAKEOVER_DURATION
            .with_label_values(&[trigger])
            .observe(start.elapsed().as_secs_f64());
    }

    async fn fence(&mut self, cause: FenceCause) {
        self.fence_cause = Some(cause);
        self.fenced.enter(cause.as_label());
        self.resources.release_all().await;
        self.store.set_degraded(false);
        if let Err(e) = self.fencing_agent.on_fence(cause.as_label()).await {
            warn!(error = %e, "Fencing agent reported failure");
        }
        self.transition(Role::Fenced, self.epoch);
    }

    fn unfence(&mut self, reason: &str) {
        let entered_at = self.fenced.entered_at();
        if self.fenced.try_exit(entered_at, reason) {
            self.fence_cause = None;
            self.transition(Role::Backup, self.epoch);
            // Agent notification is fire-and-forget from a sync context;
            // spawn it rather than restructure the callers around it
            let agent = Arc::clone(&self.fencing_agent);
            tokio::spawn(async move {
                if let Err(e) = agent.on_unfence().await {
                    warn!(error = %e, "Unfencing agent reported failure");
                }
            });
        }
    }

    /// Auto-failback: step aside once a better candidate has been stable
    /// for the configured delay.
    async fn check_failback(&mut self) {
        if self.config.failback_mode != FailbackMode::Auto {
            self.better_candidate_since = None;
            return;
        }

        if !self.view.better_candidate_reachable() {
            self.better_candidate_since = None;
            return;
        }

        let since = *self.better_candidate_since.get_or_insert_with(Instant::now);
        let stable_for = since.elapsed();
        if stable_for < self.config.failback_delay {
            debug!(
                stable_ms = stable_for.as_millis(),
                required_ms = self.config.failback_delay.as_millis(),
                "Better candidate reachable, waiting out failback delay"
            );
            return;
        }

        info!(
            stable_secs = stable_for.as_secs(),
            "Failing back to the preferred node"
        );
        self.better_candidate_since = None;
        self.resources.release_all().await;
        self.store.set_degraded(false);
        self.transition(Role::Backup, self.epoch);
    }

    /// A primary with no reachable replicating peer serves degraded:
    /// changes accumulate in the divergence log until someone returns.
    fn update_degraded_flag(&self) {
        let replicating_peer = self
            .view
            .peers()
            .iter()
            .any(|p| !p.witness && self.view.tracker().is_reachable(&p.id));
        self.store
            .set_degraded(self.role == Role::Primary && !replicating_peer);
    }

    /// Someone other than us could take the serving role right now.
    fn has_standby_candidate(&self) -> bool {
        self.view
            .election_candidates()
            .iter()
            .any(|(_, id)| *id != self.config.node_id)
    }

    fn transition(&mut self, role: Role, epoch: Epoch) {
        if role == self.role && epoch == self.epoch {
            return;
        }
        let from = self.role;
        self.role = role;
        self.epoch = epoch;
        self.store.set_epoch(epoch);

        if from == role {
            debug!(epoch = epoch.value(), "Epoch advanced");
        } else {
            info!(
                from = %from,
                to = %role,
                epoch = epoch.value(),
                "Role transition"
            );
            metrics::record_role_transition(from, role);
        }
        metrics::CURRENT_EPOCH.set(epoch.value() as i64);
        self.publish();
    }

    fn publish(&self) {
        self.role_tx.send_replace(RoleState {
            role: self.role,
            epoch: self.epoch,
            quorum_held: self.quorum_held,
        });
    }
}

impl std::fmt::Debug for RoleArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleArbiter")
            .field("node", &self.config.node_id)
            .field("role", &self.role)
            .field("epoch", &self.epoch)
            .field("fenced", &self.is_fenced())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::config::{PeerConfig, QuorumMode};
    use crate::cluster::fencing::LoggingFencingAgent;
    use crate::cluster::heartbeat::{PeerTracker, PeerTrackerConfig};
    use crate::cluster::virtual_ip::LoggingBackend;
    use crate::types::{NodeId, Sequence};
    use std::time::Duration;

    fn peer(id: &str, priority: u16, witness: bool) -> PeerConfig {
        PeerConfig {
            id: NodeId::from(id),
            addr: format!("{}.lan:5879", id),
            priority,
            weight: 1,
            witness,
        }
    }

    struct Fixture {
        arbiter: RoleArbiter,
        view: Arc<ClusterView>,
    }

    fn fixture(config: HaConfig) -> Fixture {
        let tracker = Arc::new(PeerTracker::new(PeerTrackerConfig {
            heartbeat_interval: Duration::from_millis(10),
            suspicion_threshold: 1,
            failure_threshold: 2,
            jitter_tolerance: Duration::ZERO,
            startup_grace: Duration::ZERO,
            ..Default::default()
        }));
        let view = Arc::new(ClusterView::new(&config, tracker));
        let store = Arc::new(ReplicatedStore::in_memory(config.node_id.clone()));
        let resources = Arc::new(VirtualIdentityManager::new(
            config.virtual_resources.clone(),
            Arc::new(LoggingBackend),
            config.resource_op_timeout,
        ));
        let arbiter = RoleArbiter::new(
            config,
            Arc::clone(&view),
            Arc::new(FencedState::new()),
            Arc::new(LoggingFencingAgent),
            resources,
            store,
        );
        Fixture { arbiter, view }
    }

    fn heartbeat(view: &ClusterView, id: &str, seq: u64, role: Role, epoch: u64) {
        view.tracker()
            .record_heartbeat(&NodeId::from(id), Sequence::new(seq), role, Epoch::new(epoch));
    }

    fn two_node_config(local_priority: u16, peer_priority: u16) -> HaConfig {
        HaConfig {
            node_id: NodeId::from("fw-a"),
            priority: local_priority,
            quorum_mode: QuorumMode::None,
            peers: vec![peer("fw-b", peer_priority, false)],
            failback_delay: Duration::from_millis(20),
            ..HaConfig::default()
        }
    }

    #[tokio::test]
    async fn test_single_node_promotes_at_startup() {
        let mut fx = fixture(HaConfig {
            node_id: NodeId::from("fw-a"),
            quorum_mode: QuorumMode::None,
            ..HaConfig::default()
        });

        assert_eq!(fx.arbiter.role(), Role::Init);
        fx.arbiter.evaluate().await;
        assert_eq!(fx.arbiter.role(), Role::Primary);
        assert_eq!(fx.arbiter.epoch(), Epoch::new(1));
    }

    #[tokio::test]
    async fn test_standby_defers_to_reachable_primary() {
        let fx = fixture(two_node_config(50, 100));
        let mut arbiter = fx.arbiter;

        // Peer is serving; even though our priority is better, a standby
        // never deposes a live primary
        heartbeat(&fx.view, "fw-b", 1, Role::Primary, 3);
        arbiter.evaluate().await;
        assert_eq!(arbiter.role(), Role::Backup);
        // Adopted the primary's epoch
        assert_eq!(arbiter.epoch(), Epoch::new(3));
    }

    #[tokio::test]
    async fn test_promotion_bumps_past_observed_epoch() {
        let fx = fixture(two_node_config(50, 100));
        let mut arbiter = fx.arbiter;

        // Peer was primary at epoch 5, now backup (it stepped down)
        heartbeat(&fx.view, "fw-b", 1, Role::Backup, 5);
        arbiter.evaluate().await;

        assert_eq!(arbiter.role(), Role::Primary);
        assert_eq!(arbiter.epoch(), Epoch::new(6));
    }

    #[tokio::test]
    async fn test_worse_priority_standby_waits() {
        let fx = fixture(two_node_config(100, 50));
        let mut arbiter = fx.arbiter;

        // Better-priority peer is reachable as a backup: it should win
        // the election, not us
        heartbeat(&fx.view, "fw-b", 1, Role::Backup, 0);
        arbiter.evaluate().await;
        assert_eq!(arbiter.role(), Role::Backup);
    }

    #[tokio::test]
    async fn test_primary_fences_on_quorum_loss() {
        let mut fx = fixture(HaConfig {
            node_id: NodeId::from("fw-a"),
            quorum_mode: QuorumMode::Majority,
            peers: vec![peer("fw-b", 50, false), peer("fw-c", 60, false)],
            ..HaConfig::default()
        });

        // Force primacy, then drop all peers (never registered = not
        // reachable): 1 of 3 votes
        fx.arbiter.role = Role::Primary;
        fx.arbiter.epoch = Epoch::new(2);
        fx.arbiter.evaluate().await;

        assert_eq!(fx.arbiter.role(), Role::Fenced);
        assert!(fx.arbiter.is_fenced());
    }

    #[tokio::test]
    async fn test_fence_lifts_after_reconciliation() {
        let mut fx = fixture(HaConfig {
            node_id: NodeId::from("fw-a"),
            quorum_mode: QuorumMode::Majority,
            peers: vec![peer("fw-b", 50, false), peer("fw-c", 60, false)],
            ..HaConfig::default()
        });
        fx.arbiter.role = Role::Primary;
        fx.arbiter.evaluate().await;
        assert!(fx.arbiter.is_fenced());

        // Quorum still lost: reconciliation lifts the fence to Backup but
        // promotion remains blocked
        fx.arbiter.handle_event(HaEvent::ReconciliationComplete).await;
        assert_eq!(fx.arbiter.role(), Role::Backup);
        assert!(!fx.arbiter.is_fenced());
    }

    #[tokio::test]
    async fn test_quorum_blocks_promotion() {
        let mut fx = fixture(HaConfig {
            node_id: NodeId::from("fw-a"),
            quorum_mode: QuorumMode::Majority,
            peers: vec![peer("fw-b", 200, false), peer("fw-c", 200, false)],
            ..HaConfig::default()
        });

        // No peers reachable: we win the election but 1 of 3 is no quorum
        fx.arbiter.evaluate().await;
        assert_eq!(fx.arbiter.role(), Role::Init);
    }

    #[tokio::test]
    async fn test_dual_primary_higher_epoch_wins() {
        let fx = fixture(two_node_config(50, 100));
        let mut arbiter = fx.arbiter;
        arbiter.role = Role::Primary;
        arbiter.epoch = Epoch::new(2);

        // Peer is primary at a higher epoch: we are the stale side
        heartbeat(&fx.view, "fw-b", 1, Role::Primary, 4);
        arbiter.evaluate().await;

        assert_eq!(arbiter.role(), Role::Fenced);
    }

    #[tokio::test]
    async fn test_dual_primary_equal_epoch_priority_tiebreak() {
        // We have the numerically larger priority value: we yield
        let fx = fixture(two_node_config(100, 50));
        let mut arbiter = fx.arbiter;
        arbiter.role = Role::Primary;
        arbiter.epoch = Epoch::new(2);

        heartbeat(&fx.view, "fw-b", 1, Role::Primary, 2);
        arbiter.evaluate().await;
        assert_eq!(arbiter.role(), Role::Fenced);
    }

    #[tokio::test]
    async fn test_dual_primary_equal_epoch_preferred_node_keeps_role() {
        let fx = fixture(two_node_config(50, 100));
        let mut arbiter = fx.arbiter;
        arbiter.role = Role::Primary;
        arbiter.epoch = Epoch::new(2);

        heartbeat(&fx.view, "fw-b", 1, Role::Primary, 2);
        arbiter.evaluate().await;
        assert_eq!(arbiter.role(), Role::Primary);
    }

    #[tokio::test]
    async fn test_auto_failback_after_delay() {
        let fx = fixture(two_node_config(100, 50));
        let mut arbiter = fx.arbiter;
        arbiter.role = Role::Primary;
        arbiter.epoch = Epoch::new(2);

        // Better-priority peer returns as a backup
        heartbeat(&fx.view, "fw-b", 1, Role::Backup, 2);
        arbiter.evaluate().await;
        // Delay (20ms) not yet elapsed
        assert_eq!(arbiter.role(), Role::Primary);

        tokio::time::sleep(Duration::from_millis(30)).await;
        heartbeat(&fx.view, "fw-b", 2, Role::Backup, 2);
        arbiter.evaluate().await;
        assert_eq!(arbiter.role(), Role::Backup);
    }

    #[tokio::test]
    async fn test_manual_failback_never_steps_down() {
        let mut config = two_node_config(100, 50);
        config.failback_mode = FailbackMode::Manual;
        let fx = fixture(config);
        let mut arbiter = fx.arbiter;
        arbiter.role = Role::Primary;
        arbiter.epoch = Epoch::new(2);

        heartbeat(&fx.view, "fw-b", 1, Role::Backup, 2);
        tokio::time::sleep(Duration::from_millis(30)).await;
        heartbeat(&fx.view, "fw-b", 2, Role::Backup, 2);
        arbiter.evaluate().await;
        assert_eq!(arbiter.role(), Role::Primary);
    }

    #[tokio::test]
    async fn test_uplink_down_hands_over_when_standby_exists() {
        let fx = fixture(two_node_config(50, 100));
        let mut arbiter = fx.arbiter;
        arbiter.role = Role::Primary;
        arbiter.epoch = Epoch::new(2);
        heartbeat(&fx.view, "fw-b", 1, Role::Backup, 2);

        arbiter.handle_event(HaEvent::Uplink(UplinkEvent::Down)).await;
        assert_eq!(arbiter.role(), Role::Fenced);

        // Recovery lifts the uplink fence without reconciliation
        arbiter.handle_event(HaEvent::Uplink(UplinkEvent::Up)).await;
        assert_ne!(arbiter.role(), Role::Fenced);
    }

    #[tokio::test]
    async fn test_uplink_down_alone_keeps_serving() {
        // No standby: fencing would just take the network fully down
        let mut fx = fixture(HaConfig {
            node_id: NodeId::from("fw-a"),
            quorum_mode: QuorumMode::None,
            ..HaConfig::default()
        });
        fx.arbiter.evaluate().await;
        assert_eq!(fx.arbiter.role(), Role::Primary);

        fx.arbiter
            .handle_event(HaEvent::Uplink(UplinkEvent::Down))
            .await;
        assert_eq!(fx.arbiter.role(), Role::Primary);
    }

    #[tokio::test]
    async fn test_force_failover_fences_until_handover() {
        let fx = fixture(two_node_config(50, 100));
        let mut arbiter = fx.arbiter;
        arbiter.role = Role::Primary;
        arbiter.epoch = Epoch::new(2);
        heartbeat(&fx.view, "fw-b", 1, Role::Backup, 2);

        arbiter.handle_event(HaEvent::ForceFailover).await;
        assert_eq!(arbiter.role(), Role::Fenced);

        // The peer takes over; the manual fence lifts
        heartbeat(&fx.view, "fw-b", 2, Role::Primary, 3);
        arbiter.evaluate().await;
        assert_eq!(arbiter.role(), Role::Backup);
        // We do not depose the new primary despite better priority
        arbiter.evaluate().await;
        assert_eq!(arbiter.role(), Role::Backup);
    }

    #[tokio::test]
    async fn test_force_failover_ignored_on_backup() {
        let fx = fixture(two_node_config(50, 100));
        let mut arbiter = fx.arbiter;
        arbiter.role = Role::Backup;
        heartbeat(&fx.view, "fw-b", 1, Role::Primary, 1);

        arbiter.handle_event(HaEvent::ForceFailover).await;
        assert_eq!(arbiter.role(), Role::Backup);
    }

    #[tokio::test]
    async fn test_degraded_flag_tracks_peer_loss() {
        let fx = fixture(two_node_config(50, 100));
        let store = Arc::clone(&fx.arbiter.store);
        let mut arbiter = fx.arbiter;

        // Alone in a quorum-none pair: promote and mark degraded
        arbiter.evaluate().await;
        assert_eq!(arbiter.role(), Role::Primary);
        assert!(store.is_degraded());

        // Peer appears: no longer degraded
        heartbeat(&fx.view, "fw-b", 1, Role::Backup, 1);
        arbiter.evaluate().await;
        assert!(!store.is_degraded());
    }

    #[tokio::test]
    async fn test_witness_peer_does_not_clear_degraded() {
        let mut fx = fixture(HaConfig {
            node_id: NodeId::from("fw-a"),
            quorum_mode: QuorumMode::Majority,
            peers: vec![peer("witness", 255, true)],
            ..HaConfig::default()
        });

        heartbeat(&fx.view, "witness", 1, Role::Backup, 0);
        fx.arbiter.evaluate().await;
        assert_eq!(fx.arbiter.role(), Role::Primary);
        // The witness holds no state; we are still degraded
        assert!(fx.arbiter.store.is_degraded());
    }

    #[tokio::test]
    async fn test_shutdown_releases_role() {
        let mut fx = fixture(two_node_config(50, 100));
        fx.arbiter.evaluate().await;
        assert_eq!(fx.arbiter.role(), Role::Primary);

        let keep_running = fx.arbiter.handle_event(HaEvent::Shutdown).await;
        assert!(!keep_running);
        assert_eq!(fx.arbiter.role(), Role::Backup);
    }

    #[tokio::test]
    async fn test_role_watch_publishes_transitions() {
        let mut fx = fixture(two_node_config(50, 100));
        let mut watch = fx.arbiter.subscribe();

        fx.arbiter.evaluate().await;
        watch.changed().await.unwrap();
        let state = *watch.borrow();
        assert_eq!(state.role, Role::Primary);
        assert_eq!(state.epoch, Epoch::new(1));
    }

    #[tokio::test]
    async fn test_epoch_adoption_publishes_on_the_watch() {
        let fx = fixture(two_node_config(100, 50));
        let mut arbiter = fx.arbiter;
        let watch = arbiter.subscribe();

        heartbeat(&fx.view, "fw-b", 1, Role::Primary, 3);
        arbiter.evaluate().await;
        assert_eq!(watch.borrow().epoch, Epoch::new(3));

        // A later epoch bump with no role change still reaches observers,
        // so outgoing heartbeats never advertise a stale epoch
        heartbeat(&fx.view, "fw-b", 2, Role::Primary, 5);
        arbiter.evaluate().await;
        let state = *watch.borrow();
        assert_eq!(state.role, Role::Backup);
        assert_eq!(state.epoch, Epoch::new(5));
    }

    #[tokio::test]
    async fn test_quorum_verdict_published_on_the_watch() {
        let mut fx = fixture(HaConfig {
            node_id: NodeId::from("fw-a"),
            quorum_mode: QuorumMode::Majority,
            peers: vec![peer("fw-b", 50, false)],
            ..HaConfig::default()
        });
        let watch = fx.arbiter.subscribe();

        // Alone in a two-node majority cluster: 1 of 2 votes
        fx.arbiter.evaluate().await;
        assert!(!watch.borrow().quorum_held);

        heartbeat(&fx.view, "fw-b", 1, Role::Backup, 0);
        fx.arbiter.evaluate().await;
        assert!(watch.borrow().quorum_held);
    }
}
