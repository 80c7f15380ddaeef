//! Outbound link to one peer.
//!
//! Each configured peer gets one `PeerLink` task. The link dials the
//! peer's listener, authenticates, and then drives everything this node
//! sends on the channel: heartbeats stamped with the current role and
//! epoch, change records from the local store feed, and snapshot resync
//! requests. Replies come back on the same connection, so the task never
//! shares the stream.
//!
//! The unacked queue survives reconnects; records the peer never
//! acknowledged are retransmitted before fresh traffic flows. The queue
//! is dropped wholesale when this node fences, because divergent records
//! must converge through reconciliation rather than retransmission.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cluster::{
    metrics, retry, HaError, HaNode, HaResult, OutboundQueue, PeerConfig, ResyncTrigger,
};
use crate::protocol::{Frame, FramePayload, FrameType};
use crate::types::{ChangeRecord, Role, Sequence};

use super::auth;
use super::connection::PeerConnection;

/// Successful heartbeat exchanges a fenced node waits for before it
/// reconciles its divergence with the peer.
const FENCED_BEATS_BEFORE_RECONCILE: u32 = 3;

/// The outbound half of the channel to one peer.
pub struct PeerLink {
    node: Arc<HaNode>,
    peer: PeerConfig,
    queue: OutboundQueue,
    heartbeat_seq: u64,
    /// Consecutive heartbeat exchanges observed while fenced.
    fenced_beats: u32,
    /// Reconciliation already kicked off for this fence episode.
    reconcile_started: bool,
}

impl PeerLink {
    pub fn new(node: Arc<HaNode>, peer: PeerConfig) -> Self {
        let max_unacked = node.config().max_unacked_records;
        let queue = OutboundQueue::new(peer.id.clone(), max_unacked);
        Self {
            node,
            peer,
            queue,
            heartbeat_seq: 0,
            fenced_beats: 0,
            reconcile_started: false,
        }
    }

    /// Drive the link until shutdown. Reconnects forever; a peer that is
    /// down for an hour is still a peer.
    pub async fn run(
        mut self,
        mut resync_rx: mpsc::Receiver<ResyncTrigger>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let retry_pause = self.node.config().heartbeat_interval;
        let partition_threshold = self.node.config().partition_resync_threshold;
        let mut lost_at: Option<Instant> = None;

        loop {
            let conn = tokio::select! {
                _ = shutdown_rx.recv() => return,
                conn = self.establish() => conn,
            };

            let mut conn = match conn {
                Ok(conn) => {
                    metrics::PEER_CONNECTIONS
                        .with_label_values(&["outbound", "established"])
                        .inc();
                    conn
                }
                Err(e) => {
                    metrics::PEER_CONNECTIONS
                        .with_label_values(&["outbound", "failed"])
                        .inc();
                    debug!(peer = %self.peer.id, error = %e, "Peer unreachable, will retry");
                    tokio::select! {
                        _ = shutdown_rx.recv() => return,
                        _ = tokio::time::sleep(retry_pause) => continue,
                    }
                }
            };

            info!(peer = %self.peer.id, addr = %self.peer.addr, "Peer link established");

            // A partition that outlasted the catch-up threshold is beyond
            // incremental replay; pull a full snapshot before resuming.
            let outage = lost_at.take().map(|t| t.elapsed()).unwrap_or_default();
            if outage >= partition_threshold
                && !self.peer.witness
                && self.node.role() != Role::Primary
            {
                warn!(
                    peer = %self.peer.id,
                    outage_secs = outage.as_secs(),
                    "Partition outlasted catch-up threshold"
                );
                let _ = resync_rx.try_recv(); // replace any queued pull
                if let Err(e) = self
                    .fetch_snapshot(
                        &mut conn,
                        ResyncTrigger::Partition,
                        self.node.config().frame_read_timeout,
                    )
                    .await
                {
                    warn!(peer = %self.peer.id, error = %e, "Post-partition resync failed");
                }
            }

            metrics::ACTIVE_PEER_CONNECTIONS.inc();
            let outcome = self.session(conn, &mut resync_rx, &mut shutdown_rx).await;
            metrics::ACTIVE_PEER_CONNECTIONS.dec();

            match outcome {
                Ok(()) => return,
                Err(e) => {
                    metrics::PEER_CONNECTIONS
                        .with_label_values(&["outbound", "lost"])
                        .inc();
                    warn!(peer = %self.peer.id, error = %e, "Peer link failed, reconnecting");
                    lost_at = Some(Instant::now());
                }
            }
        }
    }

    /// Dial and authenticate, with backoff on transient failures.
    async fn establish(&self) -> HaResult<PeerConnection> {
        let addr = self.peer.addr.clone();
        let config = self.node.config();
        let compress = config.compression;
        let read_timeout = config.frame_read_timeout;

        let mut attempt = 0u32;
        let mut conn = retry::with_replication_policy(
            || {
                let addr = addr.clone();
                async move {
                    PeerConnection::connect(&addr, compress)
                        .await
                        .map_err(HaError::from)
                }
            },
            |e: &HaError| {
                attempt += 1;
                retry::record_retry_attempt("replication", attempt);
                e.is_retriable()
            },
        )
        .await?;

        let reply = conn
            .call(&auth::auth_frame(config), read_timeout)
            .await
            .map_err(HaError::from)?;
        if reply.frame_type() != FrameType::Ack {
            return Err(HaError::Authentication {
                remote: addr.clone(),
            });
        }
        Ok(conn)
    }

    /// Drive one connected session. `Ok(())` means shutdown; any error
    /// means the connection is gone and the caller should redial.
    async fn session(
        &mut self,
        mut conn: PeerConnection,
        resync_rx: &mut mpsc::Receiver<ResyncTrigger>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> HaResult<()> {
        let read_timeout = self.node.config().frame_read_timeout;
        let interval = self.node.config().heartbeat_interval;
        // Witnesses vote; they do not hold state
        let replicate = !self.peer.witness;

        let mut feed = self.node.store().subscribe();
        let role_rx = self.node.role_watch();

        // Retransmit whatever the previous session left unacked
        let pending: Vec<ChangeRecord> = self.queue.pending().cloned().collect();
        if !pending.is_empty() {
            info!(
                peer = %self.peer.id,
                records = pending.len(),
                "Retransmitting unacked records"
            );
            for record in pending {
                let acked = self.exchange_change(&mut conn, record, read_timeout).await?;
                self.queue.ack(acked);
            }
        }

        let mut heartbeat = tokio::time::interval(interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Safety-net resync: periodically re-pull a full snapshot so silent
        // divergence cannot live past one interval. First tick is delayed a
        // full period; the startup pull already covered the beginning.
        let resync_interval = self.node.config().resync_interval;
        let mut scheduled = tokio::time::interval_at(
            tokio::time::Instant::now() + resync_interval,
            resync_interval,
        );
        scheduled.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return Ok(()),

                _ = heartbeat.tick() => {
                    let state = *role_rx.borrow();
                    if state.role == Role::Fenced && !self.queue.is_empty() {
                        let dropped = self.queue.clear();
                        info!(
                            peer = %self.peer.id,
                            dropped,
                            "Fenced: dropped unacked records pending reconciliation"
                        );
                    }

                    self.heartbeat_seq += 1;
                    let frame = Frame::heartbeat(
                        self.node.config().node_id.clone(),
                        state.epoch,
                        Sequence::new(self.heartbeat_seq),
                        state.role,
                        timestamp_ms(),
                    );
                    match conn.call(&frame, read_timeout).await {
                        Ok(reply) => {
                            metrics::HEARTBEATS_SENT.with_label_values(&["ok"]).inc();
                            if reply.frame_type() == FrameType::Ack {
                                self.queue.ack(reply.sequence);
                            }
                        }
                        Err(e) => {
                            metrics::HEARTBEATS_SENT.with_label_values(&["error"]).inc();
                            return Err(e.into());
                        }
                    }

                    if state.role == Role::Fenced {
                        self.note_fenced_beat().await;
                    } else {
                        self.fenced_beats = 0;
                        self.reconcile_started = false;
                    }
                }

                result = feed.recv(), if replicate => {
                    match result {
                        Ok(record) => {
                            if role_rx.borrow().role == Role::Fenced {
                                // Divergence converges through reconciliation
                                continue;
                            }
                            if self.queue.enqueue(record.clone()).is_err() {
                                // Overflow dropped the queue; the peer will
                                // see the gap and pull a snapshot
                                continue;
                            }
                            let acked = self
                                .exchange_change(&mut conn, record, read_timeout)
                                .await?;
                            self.queue.ack(acked);
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(
                                peer = %self.peer.id,
                                missed,
                                "Store feed lagged; peer will detect the gap"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Ok(());
                        }
                    }
                }

                _ = scheduled.tick(), if replicate => {
                    if role_rx.borrow().role == Role::Backup {
                        self.fetch_snapshot(&mut conn, ResyncTrigger::Scheduled, read_timeout)
                            .await?;
                    }
                }

                trigger = resync_rx.recv() => {
                    match trigger {
                        Some(ResyncTrigger::Startup)
                            if role_rx.borrow().role == Role::Primary =>
                        {
                            // A serving node is authoritative; pulling the
                            // queued startup snapshot here would overwrite
                            // live state with a rebooted peer's empty store
                            debug!(peer = %self.peer.id, "Skipping startup resync while serving");
                        }
                        Some(trigger) => {
                            self.fetch_snapshot(&mut conn, trigger, read_timeout).await?;
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// A fenced node that still exchanges heartbeats with the peer has
    /// caught up on its stream; after a few confirmations, reconcile the
    /// divergence so the arbiter may lift the fence. Runs once per fence
    /// episode unless the attempt itself fails.
    async fn note_fenced_beat(&mut self) {
        if self.peer.witness || self.reconcile_started {
            return;
        }
        self.fenced_beats += 1;
        if self.fenced_beats < FENCED_BEATS_BEFORE_RECONCILE {
            return;
        }
        self.reconcile_started = true;
        info!(peer = %self.peer.id, "Link stable while fenced, reconciling divergent state");
        if let Err(e) = self.node.reconcile_after_partition(&self.peer.id).await {
            warn!(peer = %self.peer.id, error = %e, "Post-partition reconciliation failed");
            self.reconcile_started = false;
        }
    }

    /// Send one change record and return the peer's cumulative ack.
    async fn exchange_change(
        &self,
        conn: &mut PeerConnection,
        record: ChangeRecord,
        read_timeout: Duration,
    ) -> HaResult<Sequence> {
        let frame = Frame::change(self.node.config().node_id.clone(), record);
        let reply = conn.call(&frame, read_timeout).await.map_err(HaError::from)?;
        metrics::RECORDS_SENT
            .with_label_values(&[self.peer.id.as_str()])
            .inc();
        match reply.payload {
            FramePayload::Ack => Ok(reply.sequence),
            other => Err(HaError::Protocol(format!(
                "unexpected reply to change record: {:?}",
                other
            ))),
        }
    }

    /// Pull a full snapshot from the peer and install it.
    async fn fetch_snapshot(
        &self,
        conn: &mut PeerConnection,
        trigger: ResyncTrigger,
        read_timeout: Duration,
    ) -> HaResult<()> {
        info!(peer = %self.peer.id, trigger = %trigger, "Requesting snapshot");
        let request = Frame {
            sender: self.node.config().node_id.clone(),
            epoch: self.node.epoch(),
            sequence: Sequence::new(0),
            payload: FramePayload::ResyncRequest {
                reason: trigger.as_label().to_string(),
            },
        };
        let reply = conn.call(&request, read_timeout).await.map_err(HaError::from)?;
        match reply.payload {
            FramePayload::ResyncData { checksum, snapshot } => {
                self.node
                    .install_snapshot(&self.peer.id, &snapshot, checksum, trigger)
                    .await
            }
            other => Err(HaError::Protocol(format!(
                "unexpected reply to resync request: {:?}",
                other
            ))),
        }
    }
}

fn timestamp_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer", &self.peer.id)
            .field("unacked", &self.queue.unacked())
            .finish()
    }
}
