//! A queryable view of cluster membership and peer health.
//!
//! `ClusterView` joins the static membership from configuration with the
//! live health data in the peer tracker. The arbiter reads it to run
//! elections and quorum checks; the node surface reads it to answer
//! operator status queries.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::config::HaConfig;
use super::heartbeat::{PeerHealthState, PeerTracker};
use crate::types::{Epoch, NodeId, Role};

/// Static facts about a member, fixed at configuration time.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub id: NodeId,
    pub addr: String,
    /// Election priority; lower values are preferred.
    pub priority: u16,
    pub weight: u32,
    pub witness: bool,
}

/// Live state of one peer, for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatus {
    pub id: NodeId,
    pub addr: String,
    pub priority: u16,
    pub witness: bool,
    /// "reachable" | "suspected" | "unreachable" | "unknown"
    pub health: String,
    pub advertised_role: Option<Role>,
    pub advertised_epoch: Option<Epoch>,
}

/// Membership plus live peer health.
pub struct ClusterView {
    local: MemberInfo,
    peers: Vec<MemberInfo>,
    tracker: Arc<PeerTracker>,
}

impl ClusterView {
    pub fn new(config: &HaConfig, tracker: Arc<PeerTracker>) -> Self {
        let local = MemberInfo {
            id: config.node_id.clone(),
            addr: config.listen_addr.clone(),
            priority: config.priority,
            weight: config.weight,
            witness: config.witness,
        };
        let peers = config
            .peers
            .iter()
            .map(|p| MemberInfo {
                id: p.id.clone(),
                addr: p.addr.clone(),
                priority: p.priority,
                weight: p.weight,
                witness: p.witness,
            })
            .collect();

        Self {
            local,
            peers,
            tracker,
        }
    }

    pub fn local(&self) -> &MemberInfo {
        &self.local
    }

    pub fn peers(&self) -> &[MemberInfo] {
        &self.peers
    }

    pub fn tracker(&self) -> &Arc<PeerTracker> {
        &self.tracker
    }

    /// Static info for a member, local node included.
    pub fn member(&self, id: &NodeId) -> Option<&MemberInfo> {
        if *id == self.local.id {
            return Some(&self.local);
        }
        self.peers.iter().find(|p| p.id == *id)
    }

    /// Peers currently in the Reachable state.
    pub fn reachable_peers(&self) -> HashSet<NodeId> {
        self.peers
            .iter()
            .filter(|p| self.tracker.is_reachable(&p.id))
            .map(|p| p.id.clone())
            .collect()
    }

    /// Peers not yet declared Unreachable (Reachable or Suspected).
    ///
    /// Suspected peers still count as present for failback purposes: a
    /// blip should not reset the failback delay timer.
    pub fn live_peers(&self) -> HashSet<NodeId> {
        self.peers
            .iter()
            .filter(|p| {
                matches!(
                    self.tracker.peer_state(&p.id),
                    Some(PeerHealthState::Reachable) | Some(PeerHealthState::Suspected)
                )
            })
            .map(|p| p.id.clone())
            .collect()
    }

    /// Election candidates: reachable, non-witness members, local node
    /// included. Returned as `(priority, id)` pairs; the winner is the
    /// minimum, so lower priority values win and ties break on the
    /// lexically smaller id.
    ///
    /// Peers advertising the Fenced role are excluded: a fenced node has
    /// declared itself unfit to serve, and skipping it here is what lets
    /// the rest of the cluster take over from it.
    pub fn election_candidates(&self) -> Vec<(u16, NodeId)> {
        let mut candidates = Vec::new();
        if !self.local.witness {
            candidates.push((self.local.priority, self.local.id.clone()));
        }
        for peer in &self.peers {
            if !peer.witness && self.tracker.is_reachable(&peer.id) && !self.is_fenced(&peer.id) {
                candidates.push((peer.priority, peer.id.clone()));
            }
        }
        candidates
    }

    fn is_fenced(&self, id: &NodeId) -> bool {
        self.tracker.advertised_role(id) == Some(Role::Fenced)
    }

    /// The node that should hold the serving role given current
    /// reachability, or `None` when no eligible node is reachable.
    pub fn elect(&self) -> Option<NodeId> {
        self.election_candidates()
            .into_iter()
            .min()
            .map(|(_, id)| id)
    }

    /// True when a reachable eligible peer has a lower (better) priority
    /// than the local node, or equal priority with a lexically smaller id.
    pub fn better_candidate_reachable(&self) -> bool {
        self.peers.iter().any(|p| {
            !p.witness
                && self.tracker.is_reachable(&p.id)
                && !self.is_fenced(&p.id)
                && (p.priority, &p.id) < (self.local.priority, &self.local.id)
        })
    }

    /// A peer currently advertising the Primary role, if any is reachable.
    pub fn reachable_primary(&self) -> Option<NodeId> {
        self.peers.iter().find_map(|p| {
            if self.tracker.is_reachable(&p.id)
                && self.tracker.advertised_role(&p.id) == Some(Role::Primary)
            {
                Some(p.id.clone())
            } else {
                None
            }
        })
    }

    /// Highest epoch any peer has advertised.
    pub fn highest_advertised_epoch(&self) -> Epoch {
        self.peers
            .iter()
            .filter_map(|p| self.tracker.advertised_epoch(&p.id))
            .max()
            .unwrap_or_default()
    }

    /// Status rows for every configured peer, for the operator surface.
    pub fn peer_statuses(&self) -> Vec<PeerStatus> {
        self.peers
            .iter()
            .map(|p| PeerStatus {
                id: p.id.clone(),
                addr: p.addr.clone(),
                priority: p.priority,
                witness: p.witness,
                health: match self.tracker.peer_state(&p.id) {
                    Some(state) => state.to_string(),
                    None => "unknown".to_string(),
                },
                advertised_role: self.tracker.advertised_role(&p.id),
                advertised_epoch: self.tracker.advertised_epoch(&p.id),
            })
            .collect()
    }
}

impl std::fmt::Debug for ClusterView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterView")
            .field("local", &self.local.id)
            .field("peers", &self.peers.len())
            .finish()
    }
}
