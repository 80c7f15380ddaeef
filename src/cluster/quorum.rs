//! Quorum evaluation over the configured cluster membership.
//!
//! Quorum is the split-brain guard: a node may only take or keep the
//! serving role while its side of the cluster holds quorum. Four modes are
//! supported:
//!
//! - **Majority**: strictly more than half of all votes reachable
//! - **Weighted**: strictly more than half of the total vote weight
//! - **Strict**: every configured member reachable
//! - **None**: quorum always held (two-node setups without a witness;
//!   explicitly unsafe against partitions)
//!
//! Witness nodes contribute votes but never take the serving role. The
//! evaluator counts the local node as reachable by definition.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use super::config::{HaConfig, QuorumMode};
use super::metrics;
use crate::types::NodeId;

/// Per-node vote weight lookup.
///
/// The default implementation is [`StaticWeights`] built from configuration.
/// The trait exists so tests and future dynamic-membership work can swap
/// the source.
pub trait WeightProvider: Send + Sync {
    /// Vote weight of a node. Unknown nodes weigh zero.
    fn weight(&self, node: &NodeId) -> u32;

    /// Sum of all member weights.
    fn total_weight(&self) -> u64;
}

/// Weight table built from the static cluster configuration.
#[derive(Debug, Clone)]
pub struct StaticWeights {
    weights: HashMap<NodeId, u32>,
}

impl StaticWeights {
    pub fn from_config(config: &HaConfig) -> Self {
        let mut weights = HashMap::new();
        weights.insert(config.node_id.clone(), config.weight);
        for peer in &config.peers {
            weights.insert(peer.id.clone(), peer.weight);
        }
        Self { weights }
    }
}

impl WeightProvider for StaticWeights {
    fn weight(&self, node: &NodeId) -> u32 {
        self.weights.get(node).copied().unwrap_or(0)
    }

    fn total_weight(&self) -> u64 {
        self.weights.values().map(|w| u64::from(*w)).sum()
    }
}

/// A cluster member as the quorum evaluator sees it.
#[derive(Debug, Clone)]
pub struct QuorumMember {
    pub id: NodeId,
    pub witness: bool,
}

/// Outcome of a quorum evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumDecision {
    /// Whether this side of the cluster holds quorum.
    pub held: bool,
    /// Votes (or weight, in Weighted mode) reachable, local node included.
    pub reachable_votes: u64,
    /// Total votes (or weight) configured.
    pub total_votes: u64,
}

/// Evaluates quorum from the static membership and a reachability set.
///
/// The evaluator is stateless apart from edge detection for the
/// quorum-loss counter; the arbiter owns what to DO about a decision.
pub struct QuorumEvaluator {
    mode: QuorumMode,
    local: NodeId,
    members: Vec<QuorumMember>,
    weights: Box<dyn WeightProvider>,
    previously_held: AtomicBool,
}

impl QuorumEvaluator {
    pub fn from_config(config: &HaConfig) -> Self {
        let mut members = vec![QuorumMember {
            id: config.node_id.clone(),
            witness: config.witness,
        }];
        for peer in &config.peers {
            members.push(QuorumMember {
                id: peer.id.clone(),
                witness: peer.witness,
            });
        }

        Self {
            mode: config.quorum_mode,
            local: config.node_id.clone(),
            members,
            weights: Box::new(StaticWeights::from_config(config)),
            previously_held: AtomicBool::new(true),
        }
    }

    /// Replace the weight source (used by tests).
    pub fn with_weights(mut self, weights: Box<dyn WeightProvider>) -> Self {
        self.weights = weights;
        self
    }

    pub fn mode(&self) -> QuorumMode {
        self.mode
    }

    /// Total number of voting members, local node included.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Members eligible for the serving role (non-witnesses).
    pub fn eligible_members(&self) -> impl Iterator<Item = &NodeId> {
        self.members
            .iter()
            .filter(|m| !m.witness)
            .map(|m| &m.id)
    }

    /// Evaluate quorum given the set of currently reachable peers.
    ///
    /// The local node is counted as reachable whether or not it appears in
    /// the set. Transitions from held to lost bump the loss counter once
    /// per edge, not once per evaluation.
    pub fn evaluate(&self, reachable_peers: &HashSet<NodeId>) -> QuorumDecision {
        let is_reachable =
            |id: &NodeId| *id == self.local || reachable_peers.contains(id);

        let decision = match self.mode {
            QuorumMode::None => QuorumDecision {
                held: true,
                reachable_votes: 1,
                total_votes: 1,
            },
            QuorumMode::Majority => {
                let total = self.members.len() as u64;
                let reachable = self
                    .members
                    .iter()
                    .filter(|m| is_reachable(&m.id))
                    .count() as u64;
                QuorumDecision {
                    held: reachable * 2 > total,
                    reachable_votes: reachable,
                    total_votes: total,
                }
            }
            QuorumMode::Weighted => {
                let total = self.weights.total_weight();
                let reachable: u64 = self
                    .members
                    .iter()
                    .filter(|m| is_reachable(&m.id))
                    .map(|m| u64::from(self.weights.weight(&m.id)))
                    .sum();
                QuorumDecision {
                    held: reachable * 2 > total,
                    reachable_votes: reachable,
                    total_votes: total,
                }
            }
            QuorumMode::Strict => {
                let total = self.members.len() as u64;
                let reachable = self
                    .members
                    .iter()
                    .filter(|m| is_reachable(&m.id))
                    .count() as u64;
                QuorumDecision {
                    held: reachable == total,
                    reachable_votes: reachable,
                    total_votes: total,
                }
            }
        };

        metrics::QUORUM_REACHABLE_VOTES.set(decision.reachable_votes as i64);
        metrics::QUORUM_HELD.set(i64::from(decision.held));

        let was_held = self.previously_held.swap(decision.held, Ordering::AcqRel);
        if was_held && !decision.held {
            warn!(
                mode = %self.mode,
                reachable_votes = decision.reachable_votes,
                total_votes = decision.total_votes,
                "Quorum LOST"
            );
            metrics::QUORUM_LOSSES.inc();
        } else if !was_held && decision.held {
            debug!(
                mode = %self.mode,
                reachable_votes = decision.reachable_votes,
                "Quorum regained"
            );
        }

        decision
    }
}

impl std::fmt::Debug for QuorumEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuorumEvaluator")
            .field("mode", &self.mode)
            .field("local", &self.local)
            .field("members", &self.members.len())
            .finish()
    }
}
