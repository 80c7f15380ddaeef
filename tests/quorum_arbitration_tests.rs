//! Tests for quorum evaluation and election over the cluster view.
//!
//! Covers:
//! 1. The four quorum modes against explicit reachability sets
//! 2. Witness votes and eligibility
//! 3. Election determinism (priority, then lexical id)
//! 4. Exclusion of unreachable and fenced peers from elections

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use carpaccio::cluster::{
    ClusterView, HaConfig, PeerConfig, PeerHealthState, PeerTracker, QuorumEvaluator, QuorumMode,
    WeightProvider,
};
use carpaccio::types::{Epoch, NodeId, Role, Sequence};

fn peer(id: &str, priority: u16, weight: u32, witness: bool) -> PeerConfig {
    PeerConfig {
        id: NodeId::from(id),
        addr: format!("{}.lan:5879", id),
        priority,
        weight,
        witness,
    }
}

fn config(mode: QuorumMode, peers: Vec<PeerConfig>) -> HaConfig {
    HaConfig {
        node_id: NodeId::from("fw-a"),
        shared_secret: "secret".to_string(),
        priority: 100,
        quorum_mode: mode,
        peers,
        ..HaConfig::default()
    }
}

fn reachable(ids: &[&str]) -> HashSet<NodeId> {
    ids.iter().map(|id| NodeId::from(*id)).collect()
}

// --- Quorum modes ---

#[test]
fn test_majority_two_node_pair_needs_the_peer() {
    let evaluator =
        QuorumEvaluator::from_config(&config(QuorumMode::Majority, vec![peer("fw-b", 200, 1, false)]));

    // Alone: 1 of 2 votes is not a strict majority
    let decision = evaluator.evaluate(&reachable(&[]));
    assert!(!decision.held);
    assert_eq!(decision.reachable_votes, 1);
    assert_eq!(decision.total_votes, 2);

    assert!(evaluator.evaluate(&reachable(&["fw-b"])).held);
}

#[test]
fn test_majority_witness_breaks_the_tie() {
    // Two appliances plus a witness: losing the peer but keeping the
    // witness keeps quorum, which is the whole point of deploying one
    let evaluator = QuorumEvaluator::from_config(&config(
        QuorumMode::Majority,
        vec![peer("fw-b", 200, 1, false), peer("arbiter", 65535, 1, true)],
    ));

    assert!(evaluator.evaluate(&reachable(&["arbiter"])).held);
    assert!(evaluator.evaluate(&reachable(&["fw-b"])).held);
    assert!(!evaluator.evaluate(&reachable(&[])).held);
}

#[test]
fn test_weighted_mode_counts_weight_not_heads() {
    let mut cfg = config(
        QuorumMode::Weighted,
        vec![peer("fw-b", 200, 1, false), peer("fw-c", 300, 1, false)],
    );
    cfg.weight = 3;
    let evaluator = QuorumEvaluator::from_config(&cfg);

    // Local node alone carries 3 of 5: strictly more than half
    let decision = evaluator.evaluate(&reachable(&[]));
    assert!(decision.held);
    assert_eq!(decision.reachable_votes, 3);
    assert_eq!(decision.total_votes, 5);

    // The two peers together carry 2 of 5 on their side; from our side
    // reaching one of them makes it 4
    assert!(evaluator.evaluate(&reachable(&["fw-c"])).held);
}

#[test]
fn test_weighted_exact_half_is_not_quorum() {
    let mut cfg = config(
        QuorumMode::Weighted,
        vec![peer("fw-b", 200, 2, false)],
    );
    cfg.weight = 2;
    let evaluator = QuorumEvaluator::from_config(&cfg);

    // 2 of 4 is exactly half; strictly-more-than-half must fail
    assert!(!evaluator.evaluate(&reachable(&[])).held);
}

#[test]
fn test_strict_mode_requires_everyone() {
    let evaluator = QuorumEvaluator::from_config(&config(
        QuorumMode::Strict,
        vec![peer("fw-b", 200, 1, false), peer("fw-c", 300, 1, false)],
    ));

    assert!(evaluator.evaluate(&reachable(&["fw-b", "fw-c"])).held);
    assert!(!evaluator.evaluate(&reachable(&["fw-b"])).held);
}

#[test]
fn test_none_mode_always_holds() {
    let evaluator =
        QuorumEvaluator::from_config(&config(QuorumMode::None, vec![peer("fw-b", 200, 1, false)]));
    assert!(evaluator.evaluate(&reachable(&[])).held);
}

#[test]
fn test_unknown_nodes_do_not_vote() {
    let evaluator =
        QuorumEvaluator::from_config(&config(QuorumMode::Majority, vec![peer("fw-b", 200, 1, false)]));

    // A reachability set naming a stranger changes nothing
    let decision = evaluator.evaluate(&reachable(&["fw-z"]));
    assert!(!decision.held);
    assert_eq!(decision.reachable_votes, 1);
}

#[test]
fn test_custom_weight_provider() {
    struct Doubled;
    impl WeightProvider for Doubled {
        fn weight(&self, _node: &NodeId) -> u32 {
            2
        }
        fn total_weight(&self) -> u64 {
            6
        }
    }

    let evaluator = QuorumEvaluator::from_config(&config(
        QuorumMode::Weighted,
        vec![peer("fw-b", 200, 1, false), peer("fw-c", 300, 1, false)],
    ))
    .with_weights(Box::new(Doubled));

    // 4 of 6 with one peer reachable
    let decision = evaluator.evaluate(&reachable(&["fw-b"]));
    assert!(decision.held);
    assert_eq!(decision.reachable_votes, 4);
}

#[test]
fn test_witnesses_vote_but_cannot_serve() {
    let evaluator = QuorumEvaluator::from_config(&config(
        QuorumMode::Majority,
        vec![peer("fw-b", 200, 1, false), peer("arbiter", 65535, 1, true)],
    ));

    assert_eq!(evaluator.member_count(), 3);
    let eligible: Vec<_> = evaluator.eligible_members().collect();
    assert_eq!(eligible.len(), 2);
    assert!(!eligible.contains(&&NodeId::from("arbiter")));
}

// --- Election over the cluster view ---

fn fast_view(peers: Vec<PeerConfig>) -> (ClusterView, Arc<PeerTracker>) {
    let cfg = HaConfig {
        heartbeat_interval: Duration::from_millis(50),
        suspicion_threshold: 2,
        failure_threshold: 6,
        jitter_tolerance: Duration::from_millis(10),
        startup_grace: Duration::ZERO,
        ..config(QuorumMode::Majority, peers)
    };
    let tracker = Arc::new(PeerTracker::new(
        carpaccio::cluster::heartbeat::PeerTrackerConfig::from_ha_config(&cfg),
    ));
    for p in &cfg.peers {
        tracker.register_peer(p.id.clone());
    }
    let view = ClusterView::new(&cfg, Arc::clone(&tracker));
    (view, tracker)
}

fn beat(tracker: &PeerTracker, peer: &str, seq: u64, role: Role, epoch: u64) {
    tracker.record_heartbeat(
        &NodeId::from(peer),
        Sequence::new(seq),
        role,
        Epoch::new(epoch),
    );
}

#[test]
fn test_election_prefers_lower_priority() {
    let (view, tracker) = fast_view(vec![peer("fw-b", 50, 1, false)]);
    beat(&tracker, "fw-b", 1, Role::Backup, 1);

    assert_eq!(view.elect(), Some(NodeId::from("fw-b")));
    assert!(view.better_candidate_reachable());
}

#[test]
fn test_election_breaks_priority_ties_lexically() {
    // Same priority as the local node ("fw-a"): the lexically smaller id
    // wins, deterministically on both nodes
    let (view, tracker) = fast_view(vec![peer("fw-0", 100, 1, false)]);
    beat(&tracker, "fw-0", 1, Role::Backup, 1);

    assert_eq!(view.elect(), Some(NodeId::from("fw-0")));

    let (view, tracker) = fast_view(vec![peer("fw-z", 100, 1, false)]);
    beat(&tracker, "fw-z", 1, Role::Backup, 1);
    assert_eq!(view.elect(), Some(NodeId::from("fw-a")));
}

#[test]
fn test_election_skips_witnesses() {
    let (view, tracker) = fast_view(vec![peer("arbiter", 1, 1, true)]);
    beat(&tracker, "arbiter", 1, Role::Backup, 1);

    // Best priority in the cluster, but a witness never serves
    assert_eq!(view.elect(), Some(NodeId::from("fw-a")));
    assert!(!view.better_candidate_reachable());
}

#[test]
fn test_election_skips_fenced_peers() {
    let (view, tracker) = fast_view(vec![peer("fw-b", 50, 1, false)]);
    beat(&tracker, "fw-b", 1, Role::Fenced, 3);

    // fw-b would win on priority, but it has declared itself unfit
    assert_eq!(view.elect(), Some(NodeId::from("fw-a")));
    assert!(!view.better_candidate_reachable());
}

#[test]
fn test_unreachable_peer_leaves_the_election() {
    let (view, tracker) = fast_view(vec![peer("fw-b", 50, 1, false)]);
    beat(&tracker, "fw-b", 1, Role::Primary, 2);
    assert_eq!(view.elect(), Some(NodeId::from("fw-b")));

    // Past the failure threshold (6 x 50ms) with margin
    std::thread::sleep(Duration::from_millis(450));
    let changes = tracker.check_peers();
    assert!(changes
        .iter()
        .any(|c| c.new_state == PeerHealthState::Unreachable));

    assert_eq!(view.elect(), Some(NodeId::from("fw-a")));
    assert_eq!(view.reachable_primary(), None);
}

#[test]
fn test_suspected_peer_is_live_but_not_electable() {
    let (view, tracker) = fast_view(vec![peer("fw-b", 50, 1, false)]);
    beat(&tracker, "fw-b", 1, Role::Backup, 1);

    // Past suspicion (2 x 50ms + jitter) but well short of failure
    std::thread::sleep(Duration::from_millis(180));
    tracker.check_peers();
    assert_eq!(
        tracker.peer_state(&NodeId::from("fw-b")),
        Some(PeerHealthState::Suspected)
    );

    assert_eq!(view.elect(), Some(NodeId::from("fw-a")));
    assert!(view.live_peers().contains(&NodeId::from("fw-b")));
    assert!(!view.reachable_peers().contains(&NodeId::from("fw-b")));
}

#[test]
fn test_view_tracks_advertised_epochs() {
    let (view, tracker) = fast_view(vec![
        peer("fw-b", 200, 1, false),
        peer("fw-c", 300, 1, false),
    ]);
    beat(&tracker, "fw-b", 1, Role::Primary, 4);
    beat(&tracker, "fw-c", 1, Role::Backup, 7);

    assert_eq!(view.highest_advertised_epoch(), Epoch::new(7));
    assert_eq!(view.reachable_primary(), Some(NodeId::from("fw-b")));
}

#[test]
fn test_stale_heartbeats_are_discarded() {
    let (_view, tracker) = fast_view(vec![peer("fw-b", 200, 1, false)]);
    beat(&tracker, "fw-b", 5, Role::Backup, 1);
    beat(&tracker, "fw-b", 3, Role::Primary, 9);

    // The replayed heartbeat must not update the advertised state
    assert_eq!(
        tracker.advertised_role(&NodeId::from("fw-b")),
        Some(Role::Backup)
    );
    assert_eq!(
        tracker.advertised_epoch(&NodeId::from("fw-b")),
        Some(Epoch::new(1))
    );
}
