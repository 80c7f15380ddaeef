//! Post-partition state reconciliation.
//!
//! During a partition both sides may serve in degraded mode and mutate the
//! same entities. When connectivity returns, each node holds a divergence
//! log of the changes it made while alone; the reconciler merges the two
//! logs into one convergent decision per entity.
//!
//! Both nodes run the same deterministic algorithm over the same two logs,
//! so they reach the same answers without a coordination round.
//!
//! Strategies:
//!
//! - **Timestamp** (default): the later write wins. Timestamps closer
//!   together than the clock-skew tolerance are treated as concurrent and
//!   fall back to the priority rule.
//! - **Priority**: the preferred node's write wins, regardless of time.
//! - **Manual**: conflicts queue for the operator; any left unresolved
//!   past the timeout are settled by the timestamp rule so the cluster
//!   never wedges on an absent operator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::config::{HaConfig, ReconcileStrategy};
use super::metrics;
use crate::types::{ChangeRecord, EntityKey, NodeId};

/// Which side's write survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictOutcome {
    LocalWins,
    RemoteWins,
}

/// A conflict awaiting operator resolution (Manual strategy only).
#[derive(Debug, Clone)]
pub struct Conflict {
    pub id: u64,
    pub entity_key: EntityKey,
    pub local: ChangeRecord,
    pub remote: ChangeRecord,
    pub detected_at: Instant,
}

/// Serializable view of a pending conflict for the operator surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictSummary {
    pub id: u64,
    pub entity_key: EntityKey,
    pub local_timestamp_ms: u64,
    pub remote_timestamp_ms: u64,
    pub remote_origin: NodeId,
    pub age_secs: u64,
}

/// Result of merging two divergence logs.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Remote records that won and must be applied locally.
    pub apply_remote: Vec<ChangeRecord>,
    /// Local records that won. The caller re-asserts these as fresh
    /// changes so the peer (which may have applied its own write in the
    /// meantime) converges on them.
    pub local_wins: Vec<ChangeRecord>,
    /// Conflict ids queued for the operator (Manual strategy).
    pub pending: Vec<u64>,
}

/// Deterministic divergence-log merger.
pub struct Reconciler {
    strategy: ReconcileStrategy,
    clock_skew_tolerance: Duration,
    manual_timeout: Duration,
    local_id: NodeId,
    local_priority: u16,
    pending: DashMap<u64, Conflict>,
    next_conflict_id: AtomicU64,
}

impl Reconciler {
    pub fn from_config(config: &HaConfig) -> Self {
        Self {
            strategy: config.reconcile_strategy,
            clock_skew_tolerance: config.clock_skew_tolerance,
            manual_timeout: config.manual_conflict_timeout,
            local_id: config.node_id.clone(),
            local_priority: config.priority,
            pending: DashMap::new(),
            next_conflict_id: AtomicU64::new(1),
        }
    }

    pub fn strategy(&self) -> ReconcileStrategy {
        self.strategy
    }

    /// Merge the two divergence logs.
    ///
    /// `remote_priority` is the peer's configured election priority, used
    /// by the priority rule and as the concurrent-timestamp tie-break.
    pub fn reconcile(
        &self,
        local_log: Vec<ChangeRecord>,
        remote_log: Vec<ChangeRecord>,
        remote_id: &NodeId,
        remote_priority: u16,
    ) -> ReconcileReport {
        let local = last_write_per_entity(local_log);
        let mut remote = last_write_per_entity(remote_log);

        let mut report = ReconcileReport::default();

        for (key, local_record) in local {
            match remote.remove(&key) {
                None => {
                    // Only we touched it; our write stands
                    report.local_wins.push(local_record);
                }
                Some(remote_record) if remote_record.new_value == local_record.new_value => {
                    // Both sides converged on the same value
                    debug!(entity = %key, "Identical writes on both sides, no conflict");
                }
                Some(remote_record) => {
                    self.settle(
                        key,
                        local_record,
                        remote_record,
                        remote_id,
                        remote_priority,
                        &mut report,
                    );
                }
            }
        }

        // Entities only the peer touched
        report.apply_remote.extend(remote.into_values());

        info!(
            strategy = %self.strategy,
            apply_remote = report.apply_remote.len(),
            local_wins = report.local_wins.len(),
            pending = report.pending.len(),
            "Reconciliation complete"
        );
        report
    }

    fn settle(
        &self,
        key: EntityKey,
        local: ChangeRecord,
        remote: ChangeRecord,
        remote_id: &NodeId,
        remote_priority: u16,
        report: &mut ReconcileReport,
    ) {
        let outcome = match self.strategy {
            ReconcileStrategy::Timestamp => {
                Some(self.timestamp_winner(&local, &remote, remote_id, remote_priority))
            }
            ReconcileStrategy::Priority => Some(self.priority_winner(remote_id, remote_priority)),
            ReconcileStrategy::Manual => None,
        };

        match outcome {
            Some(outcome) => {
                self.record_outcome(outcome);
                match outcome {
                    ConflictOutcome::RemoteWins => report.apply_remote.push(remote),
                    ConflictOutcome::LocalWins => report.local_wins.push(local),
                }
            }
            None => {
                let id = self.next_conflict_id.fetch_add(1, Ordering::SeqCst);
                warn!(
                    conflict_id = id,
                    entity = %key,
                    "Conflict queued for manual resolution"
                );
                self.pending.insert(
                    id,
                    Conflict {
                        id,
                        entity_key: key,
                        local,
                        remote,
                        detected_at: Instant::now(),
                    },
                );
                metrics::PENDING_CONFLICTS.set(self.pending.len() as i64);
                report.pending.push(id);
            }
        }
    }

    /// Later write wins; concurrent writes fall back to priority.
    fn timestamp_winner(
        &self,
        local: &ChangeRecord,
        remote: &ChangeRecord,
        remote_id: &NodeId,
        remote_priority: u16,
    ) -> ConflictOutcome {
        let skew = local.timestamp_ms.abs_diff(remote.timestamp_ms);
        if Duration::from_millis(skew) <= self.clock_skew_tolerance {
            debug!(
                skew_ms = skew,
                "Timestamps within skew tolerance, using priority tie-break"
            );
            return self.priority_winner(remote_id, remote_priority);
        }
        if local.timestamp_ms > remote.timestamp_ms {
            ConflictOutcome::LocalWins
        } else {
            ConflictOutcome::RemoteWins
        }
    }

    /// Lower priority value wins; equal priorities break on node id.
    fn priority_winner(&self, remote_id: &NodeId, remote_priority: u16) -> ConflictOutcome {
        if (self.local_priority, &self.local_id) < (remote_priority, remote_id) {
            ConflictOutcome::LocalWins
        } else {
            ConflictOutcome::RemoteWins
        }
    }

    fn record_outcome(&self, outcome: ConflictOutcome) {
        let label = match outcome {
            ConflictOutcome::LocalWins => "local_wins",
            ConflictOutcome::RemoteWins => "remote_wins",
        };
        metrics::CONFLICTS
            .with_label_values(&[self.strategy.as_str(), label])
            .inc();
    }

    /// Pending conflicts for the operator surface.
    pub fn list_conflicts(&self) -> Vec<ConflictSummary> {
        let mut summaries: Vec<_> = self
            .pending
            .iter()
            .map(|c| ConflictSummary {
                id: c.id,
                entity_key: c.entity_key.clone(),
                local_timestamp_ms: c.local.timestamp_ms,
                remote_timestamp_ms: c.remote.timestamp_ms,
                remote_origin: c.remote.origin.clone(),
                age_secs: c.detected_at.elapsed().as_secs(),
            })
            .collect();
        summaries.sort_by_key(|s| s.id);
        summaries
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Operator decision on a pending conflict.
    ///
    /// Returns the remote record to apply when the remote side won, or
    /// `None` for a local win (or an unknown id).
    pub fn resolve_conflict(&self, id: u64, outcome: ConflictOutcome) -> Option<ChangeRecord> {
        let (_, conflict) = self.pending.remove(&id)?;
        metrics::PENDING_CONFLICTS.set(self.pending.len() as i64);
        self.record_outcome(outcome);
        info!(conflict_id = id, ?outcome, "Conflict resolved manually");
        match outcome {
            ConflictOutcome::RemoteWins => Some(conflict.remote),
            ConflictOutcome::LocalWins => None,
        }
    }

    /// Settle conflicts that outlived the manual timeout using the
    /// timestamp rule. Returns remote records that must now be applied.
    ///
    /// Called periodically by the node's housekeeping task.
    pub fn expire_conflicts(&self) -> Vec<ChangeRecord> {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|c| c.detected_at.elapsed() >= self.manual_timeout)
            .map(|c| c.id)
            .collect();

        let mut to_apply = Vec::new();
        for id in expired {
            if let Some((_, conflict)) = self.pending.remove(&id) {
                let outcome = self.timestamp_winner(
                    &conflict.local,
                    &conflict.remote,
                    &conflict.remote.origin,
                    // No live priority at hand; the id tie-break still
                    // keeps both sides deterministic
                    self.local_priority,
                );
                warn!(
                    conflict_id = id,
                    entity = %conflict.entity_key,
                    ?outcome,
                    "Manual conflict timed out, settled by timestamp"
                );
                self.record_outcome(outcome);
                if outcome == ConflictOutcome::RemoteWins {
                    to_apply.push(conflict.remote);
                }
            }
        }
        metrics::PENDING_CONFLICTS.set(self.pending.len() as i64);
        to_apply
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("strategy", &self.strategy)
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Collapse a divergence log to the final write per entity.
fn last_write_per_entity(log: Vec<ChangeRecord>) -> HashMap<EntityKey, ChangeRecord> {
    let mut latest: HashMap<EntityKey, ChangeRecord> = HashMap::new();
    for record in log {
        match latest.get(&record.entity_key) {
            Some(existing) if existing.sequence >= record.sequence => {}
            _ => {
                latest.insert(record.entity_key.clone(), record);
            }
        }
    }
    latest
}
