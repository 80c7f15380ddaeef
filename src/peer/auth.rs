//! Shared-secret handshake for the peer channel.
//!
//! The first frame on every connection must be an AUTH frame carrying the
//! cluster secret. Anything else, a wrong secret, or a sender that is not
//! in the configured membership closes the connection before a single
//! heartbeat or change record is processed.

use crate::cluster::{metrics, HaConfig, HaError, HaResult};
use crate::protocol::{Frame, FramePayload};
use crate::types::{Epoch, NodeId, Sequence};

/// Compare two secrets without leaking where they differ.
///
/// The length check short-circuits; the byte comparison does not.
pub fn secrets_match(expected: &str, presented: &str) -> bool {
    let a = expected.as_bytes();
    let b = presented.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Build the AUTH frame this node opens every outbound connection with.
pub fn auth_frame(config: &HaConfig) -> Frame {
    Frame {
        sender: config.node_id.clone(),
        epoch: Epoch::new(0),
        sequence: Sequence::new(0),
        payload: FramePayload::Auth {
            secret: config.shared_secret.clone(),
        },
    }
}

/// Verify the first frame of an inbound connection.
///
/// Returns the authenticated peer id on success. Every rejection is
/// counted on the same metric regardless of cause, so the failure counter
/// cannot be used to probe which check failed.
pub fn verify_handshake(frame: &Frame, config: &HaConfig, remote: &str) -> HaResult<NodeId> {
    let secret = match &frame.payload {
        FramePayload::Auth { secret } => secret,
        other => {
            tracing::warn!(
                remote,
                frame_type = ?other,
                "First frame was not AUTH, rejecting connection"
            );
            metrics::AUTH_FAILURES.inc();
            return Err(HaError::Authentication {
                remote: remote.to_string(),
            });
        }
    };

    if !secrets_match(&config.shared_secret, secret) {
        tracing::warn!(remote, sender = %frame.sender, "Shared secret mismatch");
        metrics::AUTH_FAILURES.inc();
        return Err(HaError::Authentication {
            remote: remote.to_string(),
        });
    }

    if !config.peers.iter().any(|p| p.id == frame.sender) {
        tracing::warn!(
            remote,
            sender = %frame.sender,
            "Authenticated sender is not a configured peer"
        );
        metrics::AUTH_FAILURES.inc();
        return Err(HaError::Authentication {
            remote: remote.to_string(),
        });
    }

    tracing::debug!(remote, peer = %frame.sender, "Peer authenticated");
    Ok(frame.sender.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::PeerConfig;

    fn config() -> HaConfig {
        HaConfig {
            node_id: NodeId::from("fw-a"),
            shared_secret: "correct horse".to_string(),
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

    fn auth_from(sender: &str, secret: &str) -> Frame {
        Frame {
            sender: NodeId::from(sender),
            epoch: Epoch::new(0),
            sequence: Sequence::new(0),
            payload: FramePayload::Auth {
                secret: secret.to_string(),
            },
        }
    }

    #[test]
    fn test_secrets_match() {
        assert!(secrets_match("s3cr3t", "s3cr3t"));
        assert!(!secrets_match("s3cr3t", "s3cr3T"));
        assert!(!secrets_match("s3cr3t", "s3cr3t "));
        assert!(!secrets_match("s3cr3t", ""));
        assert!(secrets_match("", ""));
    }

    #[test]
    fn test_handshake_accepts_configured_peer() {
        let peer = verify_handshake(
            &auth_from("fw-b", "correct horse"),
            &config(),
            "10.0.0.2:41000",
        )
        .unwrap();
        assert_eq!(peer, NodeId::from("fw-b"));
    }

    #[test]
    fn test_handshake_rejects_wrong_secret() {
        let err = verify_handshake(
            &auth_from("fw-b", "battery staple"),
            &config(),
            "10.0.0.2:41000",
        )
        .unwrap_err();
        assert!(matches!(err, HaError::Authentication { .. }));
    }

    #[test]
    fn test_handshake_rejects_stranger() {
        // Right secret, but the sender is not in the membership
        let err = verify_handshake(
            &auth_from("fw-z", "correct horse"),
            &config(),
            "10.0.0.9:41000",
        )
        .unwrap_err();
        assert!(matches!(err, HaError::Authentication { .. }));
    }

    #[test]
    fn test_handshake_rejects_non_auth_first_frame() {
        let frame = Frame::heartbeat(
            NodeId::from("fw-b"),
            Epoch::new(1),
            Sequence::new(1),
            crate::types::Role::Backup,
            0,
        );
        let err = verify_handshake(&frame, &config(), "10.0.0.2:41000").unwrap_err();
        assert!(matches!(err, HaError::Authentication { .. }));
    }

    #[test]
    fn test_auth_frame_carries_identity_and_secret() {
        let frame = auth_frame(&config());
        assert_eq!(frame.sender, NodeId::from("fw-a"));
        match frame.payload {
            FramePayload::Auth { secret } => assert_eq!(secret, "correct horse"),
            other => panic!("expected auth payload, got {:?}", other),
        }
    }
}
