//! Tests for HaConfig validation, profiles, and entry parsing.

use std::time::Duration;

use carpaccio::cluster::{
    FailbackMode, HaConfig, HaProfile, PeerConfig, QuorumMode, VirtualResourceConfig,
};
use carpaccio::types::NodeId;

fn valid_config() -> HaConfig {
    HaConfig {
        node_id: NodeId::from("fw-a"),
        shared_secret: "secret".to_string(),
        peers: vec![PeerConfig {
            id: NodeId::from("fw-b"),
            addr: "10.0.0.2:5879".to_string(),
            priority: 200,
            weight: 1,
            witness: false,
        }],
        ..HaConfig::default()
    }
}

#[test]
fn test_valid_config_passes() {
    assert!(valid_config().validate().is_ok());
}

#[test]
fn test_empty_node_id_rejected() {
    let config = HaConfig {
        node_id: NodeId::from(""),
        ..valid_config()
    };
    let errors = config.validate().unwrap_err();
    assert!(errors.iter().any(|e| e.contains("node_id")));
}

#[test]
fn test_empty_secret_rejected() {
    let config = HaConfig {
        shared_secret: String::new(),
        ..valid_config()
    };
    let errors = config.validate().unwrap_err();
    assert!(errors.iter().any(|e| e.contains("shared_secret")));
}

#[test]
fn test_suspicion_must_precede_failure() {
    let config = HaConfig {
        suspicion_threshold: 3,
        failure_threshold: 3,
        ..valid_config()
    };
    let errors = config.validate().unwrap_err();
    assert!(errors.iter().any(|e| e.contains("suspicion_threshold")));
}

#[test]
fn test_jitter_must_be_below_interval() {
    let config = HaConfig {
        heartbeat_interval: Duration::from_millis(100),
        jitter_tolerance: Duration::from_millis(100),
        ..valid_config()
    };
    let errors = config.validate().unwrap_err();
    assert!(errors.iter().any(|e| e.contains("jitter_tolerance")));
}

#[test]
fn test_own_id_in_peers_rejected() {
    let mut config = valid_config();
    config.peers.push(PeerConfig {
        id: NodeId::from("fw-a"),
        addr: "10.0.0.1:5879".to_string(),
        priority: 100,
        weight: 1,
        witness: false,
    });
    let errors = config.validate().unwrap_err();
    assert!(errors.iter().any(|e| e.contains("own id")));
}

#[test]
fn test_duplicate_peer_ids_rejected() {
    let mut config = valid_config();
    let dup = config.peers[0].clone();
    config.peers.push(dup);
    let errors = config.validate().unwrap_err();
    assert!(errors.iter().any(|e| e.contains("duplicate peer id")));
}

#[test]
fn test_all_witness_cluster_rejected() {
    let mut config = valid_config();
    config.witness = true;
    config.peers[0].witness = true;
    let errors = config.validate().unwrap_err();
    assert!(errors.iter().any(|e| e.contains("eligible for the primary role")));
}

#[test]
fn test_strict_quorum_requires_peers() {
    let config = HaConfig {
        quorum_mode: QuorumMode::Strict,
        peers: Vec::new(),
        ..valid_config()
    };
    let errors = config.validate().unwrap_err();
    assert!(errors.iter().any(|e| e.contains("strict quorum")));
}

#[test]
fn test_zero_buffer_capacities_rejected() {
    let config = HaConfig {
        reorder_buffer_capacity: 0,
        max_unacked_records: 0,
        ..valid_config()
    };
    let errors = config.validate().unwrap_err();
    assert_eq!(
        errors
            .iter()
            .filter(|e| e.contains("greater than zero"))
            .count(),
        2
    );
}

#[test]
fn test_multiple_errors_reported_together() {
    let config = HaConfig {
        node_id: NodeId::from(""),
        shared_secret: String::new(),
        ..HaConfig::default()
    };
    let errors = config.validate().unwrap_err();
    assert!(errors.len() >= 2);
}

// --- Profiles ---

#[test]
fn test_profiles_order_detection_speed() {
    let fast = HaConfig::from_profile(HaProfile::FastFailover);
    let prod = HaConfig::from_profile(HaProfile::Production);
    let conservative = HaConfig::from_profile(HaProfile::Conservative);

    assert!(fast.heartbeat_interval < prod.heartbeat_interval);
    assert!(prod.heartbeat_interval < conservative.heartbeat_interval);
}

#[test]
fn test_conservative_profile_never_fails_back_automatically() {
    let config = HaConfig::from_profile(HaProfile::Conservative);
    assert_eq!(config.failback_mode, FailbackMode::Manual);
}

#[test]
fn test_development_profile_skips_quorum() {
    let config = HaConfig::from_profile(HaProfile::Development);
    assert_eq!(config.quorum_mode, QuorumMode::None);
}

#[test]
fn test_every_profile_is_internally_consistent() {
    for profile in HaProfile::all() {
        let mut config = HaConfig::from_profile(*profile);
        config.shared_secret = "secret".to_string();
        assert!(
            config.validate().is_ok(),
            "profile {:?} fails its own validation",
            profile
        );
    }
}

// --- Entry parsing ---

#[test]
fn test_peer_entry_parses() {
    let peer = PeerConfig::parse("fw-b=10.0.0.2:5879:200:1").unwrap();
    assert_eq!(peer.id, NodeId::from("fw-b"));
    assert_eq!(peer.addr, "10.0.0.2:5879");
    assert_eq!(peer.priority, 200);
    assert_eq!(peer.weight, 1);
    assert!(!peer.witness);
}

#[test]
fn test_peer_entry_with_witness_suffix() {
    let peer = PeerConfig::parse("arbiter=10.0.0.3:5879:65535:1:witness").unwrap();
    assert!(peer.witness);
}

#[test]
fn test_peer_entry_rejects_garbage() {
    assert!(PeerConfig::parse("fw-b").is_err());
    assert!(PeerConfig::parse("=10.0.0.2:5879:200:1").is_err());
    assert!(PeerConfig::parse("fw-b=10.0.0.2:notaport:200:1").is_err());
    assert!(PeerConfig::parse("fw-b=10.0.0.2:5879:200:1:observer").is_err());
}

#[test]
fn test_resource_entry_parses() {
    let resource = VirtualResourceConfig::parse("192.0.2.1/24@eth0").unwrap();
    assert_eq!(resource.address, "192.0.2.1/24");
    assert_eq!(resource.interface, "eth0");
    assert_eq!(resource.virtual_mac, None);
}

#[test]
fn test_resource_entry_with_virtual_mac() {
    let resource =
        VirtualResourceConfig::parse("192.0.2.1/24@eth0@00:00:5e:00:01:01").unwrap();
    assert_eq!(
        resource.virtual_mac.as_deref(),
        Some("00:00:5e:00:01:01")
    );
}

#[test]
fn test_resource_entry_requires_interface() {
    assert!(VirtualResourceConfig::parse("192.0.2.1/24").is_err());
    assert!(VirtualResourceConfig::parse("@eth0").is_err());
}
