//! Node composition: wires the store, tracker, arbiter, reconciler and
//! resync machinery together and exposes the operator surface.
//!
//! `HaNode` is what an embedding process (or `main`) constructs. It owns
//! the arbiter task and the uplink prober, and provides the entry points
//! the peer link layer calls into: [`HaNode::apply_incoming`] for change
//! frames, [`HaNode::snapshot_for_peer`] / [`HaNode::install_snapshot`]
//! for resync transfers, and [`HaNode::reconcile_after_partition`] once a
//! fenced node has caught up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::arbiter::{HaEvent, RoleArbiter, RoleState};
use super::config::HaConfig;
use super::error::{HaError, HaResult};
use super::fencing::{FencedState, FencingAgent, LoggingFencingAgent};
use super::heartbeat::{PeerTracker, PeerTrackerConfig};
use super::reconciler::{ConflictOutcome, ConflictSummary, Reconciler};
use super::replication::{OfferOutcome, ReorderBuffer};
use super::resync::{record_resync, ResyncTrigger, Snapshot};
use super::store::ReplicatedStore;
use super::view::{ClusterView, PeerStatus};
use super::virtual_ip::{LoggingBackend, NetworkBackend, VirtualIdentityManager};
use super::{metrics, reachability};
use crate::types::{ChangeRecord, Epoch, NodeId, Role, Sequence};

/// Capacity of the arbiter's event inbox.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Serializable status for the operator surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub epoch: Epoch,
    pub quorum_held: bool,
    pub fenced: bool,
    pub degraded: bool,
    pub uplink_healthy: Option<bool>,
    pub peers: Vec<PeerStatus>,
    pub pending_conflicts: usize,
    pub divergence_pending: usize,
    /// Completion time of the last successful snapshot install, epoch ms.
    pub last_resync_ms: Option<u64>,
    pub last_error: Option<String>,
}

/// A running coordination node.
pub struct HaNode {
    config: HaConfig,
    store: Arc<ReplicatedStore>,
    view: Arc<ClusterView>,
    reconciler: Arc<Reconciler>,
    reorder: Arc<ReorderBuffer>,
    fenced: Arc<FencedState>,
    resources: Arc<VirtualIdentityManager>,
    prober: Option<Arc<reachability::UplinkProber>>,

    events_tx: mpsc::Sender<HaEvent>,
    role_rx: watch::Receiver<RoleState>,
    resync_tx: mpsc::Sender<NodeId>,
    resync_rx: Mutex<Option<mpsc::Receiver<NodeId>>>,
    /// Remote records applied while fenced, kept for reconciliation.
    catchup_log: Mutex<Vec<ChangeRecord>>,
    /// Epoch ms of the last successful snapshot install; 0 means never.
    last_resync_ms: AtomicU64,
    last_error: Mutex<Option<String>>,

    arbiter_task: Mutex<Option<JoinHandle<()>>>,
    prober_task: Mutex<Option<JoinHandle<()>>>,
    housekeeping_task: Mutex<Option<JoinHandle<()>>>,
}

impl HaNode {
    /// Start a node with the in-memory store, logging network backend and
    /// logging fencing agent.
    pub fn start(config: HaConfig) -> HaResult<Self> {
        Self::start_with(config, Arc::new(LoggingBackend), Arc::new(LoggingFencingAgent))
    }

    /// Start a node with custom platform seams.
    ///
    /// Must be called from within a tokio runtime; the arbiter and prober
    /// tasks are spawned on it.
    pub fn start_with(
        config: HaConfig,
        backend: Arc<dyn NetworkBackend>,
        fencing_agent: Arc<dyn FencingAgent>,
    ) -> HaResult<Self> {
        config
            .validate()
            .map_err(|errors| HaError::Config(errors.join("; ")))?;
        metrics::init_metrics();

        let tracker = Arc::new(PeerTracker::new(PeerTrackerConfig::from_ha_config(&config)));
        for peer in &config.peers {
            tracker.register_peer(peer.id.clone());
        }

        let store = Arc::new(ReplicatedStore::in_memory(config.node_id.clone()));
        let view = Arc::new(ClusterView::new(&config, tracker));
        let reconciler = Arc::new(Reconciler::from_config(&config));
        let reorder = Arc::new(ReorderBuffer::new(config.reorder_buffer_capacity));
        let fenced = Arc::new(FencedState::new());
        let resources = Arc::new(VirtualIdentityManager::new(
            config.virtual_resources.clone(),
            backend,
            config.resource_op_timeout,
        ));

        let arbiter = RoleArbiter::new(
            config.clone(),
            Arc::clone(&view),
            Arc::clone(&fenced),
            fencing_agent,
            Arc::clone(&resources),
            Arc::clone(&store),
        );
        let role_rx = arbiter.subscribe();

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let arbiter_task = tokio::spawn(arbiter.run(events_rx));

        let prober = reachability::UplinkProber::from_config(&config).map(Arc::new);
        let prober_task = prober.as_ref().map(|prober| {
            let prober = Arc::clone(prober);
            let events_tx = events_tx.clone();
            tokio::spawn(async move {
                let (uplink_tx, mut uplink_rx) = mpsc::channel(16);
                let loop_task = tokio::spawn(prober.run(uplink_tx));
                while let Some(event) = uplink_rx.recv().await {
                    if events_tx.send(HaEvent::Uplink(event)).await.is_err() {
                        break;
                    }
                }
                loop_task.abort();
            })
        });

        // Manual conflicts carry a timeout; tick them on the heartbeat
        // cadence so an unattended node still settles and unfences
        let housekeeping_task = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            let store = Arc::clone(&store);
            let events_tx = events_tx.clone();
            let period = config.heartbeat_interval;
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(e) =
                        settle_expired_conflicts(&reconciler, &store, &events_tx).await
                    {
                        warn!(error = %e, "Expired conflict settlement failed");
                    }
                }
            }
        });

        let (resync_tx, resync_rx) = mpsc::channel(16);

        info!(
            node = %config.node_id,
            peers = config.peers.len(),
            "Coordination node started"
        );

        Ok(Self {
            config,
            store,
            view,
            reconciler,
            reorder,
            fenced,
            resources,
            prober,
            events_tx,
            role_rx,
            resync_tx,
            resync_rx: Mutex::new(Some(resync_rx)),
            catchup_log: Mutex::new(Vec::new()),
            last_resync_ms: AtomicU64::new(0),
            last_error: Mutex::new(None),
            arbiter_task: Mutex::new(Some(arbiter_task)),
            prober_task: Mutex::new(prober_task),
            housekeeping_task: Mutex::new(Some(housekeeping_task)),
        })
    }

    pub fn config(&self) -> &HaConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ReplicatedStore> {
        &self.store
    }

    pub fn view(&self) -> &Arc<ClusterView> {
        &self.view
    }

    pub fn reorder(&self) -> &Arc<ReorderBuffer> {
        &self.reorder
    }

    pub fn role(&self) -> Role {
        self.role_rx.borrow().role
    }

    pub fn epoch(&self) -> Epoch {
        self.role_rx.borrow().epoch
    }

    /// Watch role/epoch changes. Used by the peer link layer to stamp
    /// heartbeats and to notice fencing.
    pub fn role_watch(&self) -> watch::Receiver<RoleState> {
        self.role_rx.clone()
    }

    /// Event sender for the peer link layer (peer health feeds through the
    /// tracker; this is for uplink and operator events).
    pub fn events(&self) -> mpsc::Sender<HaEvent> {
        self.events_tx.clone()
    }

    /// Origins that need a snapshot resync. The peer link supervisor
    /// takes this receiver once and serves the requests.
    pub fn take_resync_requests(&self) -> Option<mpsc::Receiver<NodeId>> {
        self.resync_rx.lock().expect("resync receiver lock").take()
    }

    /// Apply a change record received from a peer link.
    ///
    /// Handles reordering, replay suppression and epoch filtering, and
    /// returns the origin's applied highwater for the cumulative ack.
    /// A sequence gap that the buffer cannot bridge automatically
    /// schedules a snapshot resync for the origin.
    pub async fn apply_incoming(&self, record: ChangeRecord) -> HaResult<Sequence> {
        let origin = record.origin.clone();
        match self.reorder.offer(record) {
            Ok(OfferOutcome::Ready(records)) => {
                let fenced = self.fenced.is_active();
                for record in records {
                    if fenced {
                        self.catchup_log
                            .lock()
                            .expect("catchup log lock")
                            .push(record.clone());
                    }
                    self.store.apply_remote(&record).await?;
                }
            }
            Ok(OfferOutcome::Buffered)
            | Ok(OfferOutcome::Duplicate)
            | Ok(OfferOutcome::StaleEpoch) => {}
            Err(e) if e.needs_resync() => {
                warn!(origin = %origin, error = %e, "Stream broken, requesting resync");
                record_resync(ResyncTrigger::SequenceGap, false);
                self.request_resync(origin.clone()).await;
            }
            Err(e) => {
                self.note_error(&e);
                return Err(e);
            }
        }
        Ok(self.store.highwater(&origin))
    }

    /// Remember the most recent failure for the operator surface.
    fn note_error(&self, error: &HaError) {
        *self.last_error.lock().expect("last error lock") = Some(error.to_string());
    }

    /// Capture and encode a snapshot for a peer that requested one.
    pub async fn snapshot_for_peer(&self) -> HaResult<(bytes::Bytes, u32)> {
        let snapshot = Snapshot::capture(&self.store).await?;
        snapshot.encode()
    }

    /// Verify and install a snapshot received from a peer, then realign
    /// the reorder buffer with the snapshot's highwaters.
    pub async fn install_snapshot(
        &self,
        sender: &NodeId,
        data: &bytes::Bytes,
        checksum: u32,
        trigger: ResyncTrigger,
    ) -> HaResult<()> {
        let snapshot = match Snapshot::decode(sender, data, checksum) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                record_resync(trigger, false);
                self.note_error(&e);
                return Err(e);
            }
        };
        snapshot.install(&self.store).await?;

        for (origin, highwater) in self.store.highwaters() {
            if origin != self.config.node_id {
                self.reorder
                    .reset_origin(origin, Sequence::new(highwater));
            }
        }
        self.last_resync_ms
            .store(chrono::Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
        record_resync(trigger, true);
        Ok(())
    }

    /// Ask the link layer to fetch a snapshot from an origin.
    pub async fn request_resync(&self, origin: NodeId) {
        if self.resync_tx.send(origin.clone()).await.is_err() {
            warn!(origin = %origin, "Resync request dropped: link layer not running");
        }
    }

    /// Run post-partition reconciliation against a peer.
    ///
    /// Called once a fenced node has caught up on the peer's stream. The
    /// records applied during catch-up form the remote side; the local
    /// divergence log forms ours. Winning local values are re-emitted as
    /// fresh records so the peer converges on them, and the arbiter is
    /// told the safety fence may lift.
    pub async fn reconcile_after_partition(&self, peer: &NodeId) -> HaResult<()> {
        let remote_priority = self
            .view
            .member(peer)
            .map(|m| m.priority)
            .ok_or_else(|| HaError::Config(format!("unknown peer {}", peer)))?;

        let local_log = self.store.drain_divergence();
        let remote_log = std::mem::take(&mut *self.catchup_log.lock().expect("catchup log lock"));
        info!(
            peer = %peer,
            local_changes = local_log.len(),
            remote_changes = remote_log.len(),
            "Reconciling divergent state"
        );

        let report = self
            .reconciler
            .reconcile(local_log, remote_log, peer, remote_priority);

        // Remote wins were already applied during catch-up; local wins
        // must be re-asserted so the peer picks them up.
        for record in report.local_wins {
            self.reassert(record).await?;
        }
        for record in report.apply_remote {
            // Entities only the peer touched, or remote-won conflicts:
            // make sure the value is current, then leave it alone
            self.store.apply_remote(&record).await?;
        }

        if report.pending.is_empty() && self.reconciler.pending_count() == 0 {
            self.signal_reconciled().await;
        } else {
            info!(
                pending = report.pending.len(),
                "Reconciliation awaiting manual conflict resolution"
            );
        }
        Ok(())
    }

    async fn reassert(&self, record: ChangeRecord) -> HaResult<()> {
        debug!(entity = %record.entity_key, "Re-asserting local value");
        match record.new_value {
            Some(value) => {
                self.store.set(record.entity_key, value).await?;
            }
            None => {
                self.store.delete(record.entity_key).await?;
            }
        }
        Ok(())
    }

    async fn signal_reconciled(&self) {
        if self
            .events_tx
            .send(HaEvent::ReconciliationComplete)
            .await
            .is_err()
        {
            warn!("Arbiter gone, reconciliation signal dropped");
        }
    }

    /// Operator: move the serving role away from this node.
    pub async fn force_failover(&self) -> HaResult<()> {
        self.events_tx
            .send(HaEvent::ForceFailover)
            .await
            .map_err(|_| HaError::ChannelClosed("arbiter events".to_string()))
    }

    /// Operator: force a snapshot resync from a peer.
    pub async fn force_resync(&self, origin: NodeId) {
        record_resync(ResyncTrigger::Manual, true);
        self.request_resync(origin).await;
    }

    /// Operator: conflicts awaiting manual resolution.
    pub fn list_conflicts(&self) -> Vec<ConflictSummary> {
        self.reconciler.list_conflicts()
    }

    /// Operator: resolve one pending conflict. When the last conflict is
    /// resolved, the safety fence may lift.
    pub async fn resolve_conflict(&self, id: u64, outcome: ConflictOutcome) -> HaResult<bool> {
        let resolved = match self.reconciler.resolve_conflict(id, outcome) {
            Some(remote_record) => {
                self.store.apply_remote(&remote_record).await?;
                true
            }
            None => outcome == ConflictOutcome::LocalWins,
        };
        if resolved && self.reconciler.pending_count() == 0 {
            self.signal_reconciled().await;
        }
        Ok(resolved)
    }

    /// Settle manual conflicts that outlived their timeout. Driven by the
    /// housekeeping task; also callable by an embedding process.
    pub async fn expire_conflicts(&self) -> HaResult<()> {
        settle_expired_conflicts(&self.reconciler, &self.store, &self.events_tx).await
    }

    /// Current status for the operator surface.
    pub fn status(&self) -> NodeStatus {
        let state = *self.role_rx.borrow();
        let last_resync = self.last_resync_ms.load(Ordering::Relaxed);
        NodeStatus {
            node_id: self.config.node_id.clone(),
            role: state.role,
            epoch: state.epoch,
            quorum_held: state.quorum_held,
            fenced: self.fenced.is_active(),
            degraded: self.store.is_degraded() || self.resources.is_degraded(),
            uplink_healthy: self.prober.as_ref().map(|p| p.is_healthy()),
            peers: self.view.peer_statuses(),
            pending_conflicts: self.reconciler.pending_count(),
            divergence_pending: self.store.divergence_len(),
            last_resync_ms: (last_resync > 0).then_some(last_resync),
            last_error: self.last_error.lock().expect("last error lock").clone(),
        }
    }

    /// Graceful shutdown: demote if serving, stop the background tasks.
    pub async fn shutdown(&self) {
        info!(node = %self.config.node_id, "Shutting down coordination node");
        let _ = self.events_tx.send(HaEvent::Shutdown).await;

        if let Some(task) = self
            .prober_task
            .lock()
            .expect("prober task lock")
            .take()
        {
            task.abort();
        }
        if let Some(task) = self
            .housekeeping_task
            .lock()
            .expect("housekeeping task lock")
            .take()
        {
            task.abort();
        }
        let arbiter_task = self
            .arbiter_task
            .lock()
            .expect("arbiter task lock")
            .take();
        if let Some(task) = arbiter_task {
            if tokio::time::timeout(self.config.shutdown_grace, task)
                .await
                .is_err()
            {
                warn!("Arbiter did not stop within the shutdown grace period");
            }
        }
    }
}

/// Apply expired-conflict verdicts and lift the fence once nothing is
/// pending. Shared between [`HaNode::expire_conflicts`] and the
/// housekeeping task.
async fn settle_expired_conflicts(
    reconciler: &Reconciler,
    store: &ReplicatedStore,
    events_tx: &mpsc::Sender<HaEvent>,
) -> HaResult<()> {
    let had_pending = reconciler.pending_count() > 0;
    for record in reconciler.expire_conflicts() {
        store.apply_remote(&record).await?;
    }
    if had_pending && reconciler.pending_count() == 0 {
        if events_tx.send(HaEvent::ReconciliationComplete).await.is_err() {
            warn!("Arbiter gone, reconciliation signal dropped");
        }
    }
    Ok(())
}

impl std::fmt::Debug for HaNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaNode")
            .field("node", &self.config.node_id)
            .field("role", &self.role())
            .finish()
    }
}
