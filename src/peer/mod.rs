//! The peer link layer: authenticated TCP channels between cluster nodes.
//!
//! [`PeerChannel`] is the network face of a coordination node. It binds
//! the listener from [`HaConfig::listen_addr`], accepts connections from
//! configured peers, and runs one outbound [`PeerLink`] task per peer.
//! Every connection starts with a shared-secret handshake ([`auth`]);
//! frames are length-prefixed ([`connection`]) and dispatched into the
//! owning [`HaNode`]:
//!
//! - heartbeats feed the peer tracker,
//! - change records flow through [`HaNode::apply_incoming`] and are
//!   answered with cumulative acks,
//! - resync requests are answered with checksummed snapshots.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use carpaccio::cluster::{HaConfig, HaNode};
//! use carpaccio::peer::PeerChannel;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Arc::new(HaNode::start(HaConfig::from_env()?)?);
//!     let channel = PeerChannel::bind(Arc::clone(&node)).await?;
//!     channel.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! [`HaConfig::listen_addr`]: crate::cluster::HaConfig::listen_addr

pub mod auth;
pub mod connection;
mod link;
#[cfg(feature = "tls")]
pub mod tls;

pub use connection::PeerConnection;
pub use link::PeerLink;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::{metrics, HaError, HaNode, HaResult, ResyncTrigger};
use crate::error::{Error, Result};
use crate::protocol::{Frame, FramePayload};
use crate::types::{NodeId, Sequence};

/// Queued resync requests per link before backpressure applies.
const RESYNC_QUEUE_CAPACITY: usize = 4;

/// The peer channel supervisor: listener plus one outbound link per peer.
pub struct PeerChannel {
    node: Arc<HaNode>,
    listener: TcpListener,
    shutdown_tx: broadcast::Sender<()>,
    link_tasks: Vec<JoinHandle<()>>,
    router_task: Option<JoinHandle<()>>,
}

impl PeerChannel {
    /// Bind the coordination listener and spawn the per-peer links.
    ///
    /// A non-witness node also queues a startup snapshot pull from each
    /// non-witness peer, so a rebooted backup converges before it can be
    /// elected.
    pub async fn bind(node: Arc<HaNode>) -> Result<Self> {
        let listener = TcpListener::bind(&node.config().listen_addr)
            .await
            .map_err(|e| Error::IoError(e.kind()))?;
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut link_tasks = Vec::new();
        let mut resync_routes: HashMap<NodeId, mpsc::Sender<ResyncTrigger>> = HashMap::new();

        for peer in &node.config().peers {
            let (resync_tx, resync_rx) = mpsc::channel(RESYNC_QUEUE_CAPACITY);

            if !node.config().witness && !peer.witness {
                // The channel is not drained until the link connects, so
                // this just queues the request.
                let _ = resync_tx.try_send(ResyncTrigger::Startup);
            }
            resync_routes.insert(peer.id.clone(), resync_tx);

            let link = PeerLink::new(Arc::clone(&node), peer.clone());
            link_tasks.push(tokio::spawn(
                link.run(resync_rx, shutdown_tx.subscribe()),
            ));
        }

        let router_task = node.take_resync_requests().map(|mut requests| {
            let routes = resync_routes;
            tokio::spawn(async move {
                while let Some(origin) = requests.recv().await {
                    match routes.get(&origin) {
                        Some(route) => {
                            if route.send(ResyncTrigger::SequenceGap).await.is_err() {
                                warn!(origin = %origin, "Resync request dropped: link gone");
                            }
                        }
                        None => warn!(origin = %origin, "Resync requested for unknown origin"),
                    }
                }
            })
        });

        info!(
            addr = %node.config().listen_addr,
            peers = node.config().peers.len(),
            "Peer channel listening"
        );

        Ok(Self {
            node,
            listener,
            shutdown_tx,
            link_tasks,
            router_task,
        })
    }

    /// The address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::IoError(e.kind()))
    }

    /// Accept inbound peer connections until shutdown.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Peer channel shutting down, no longer accepting connections");
                    return Ok(());
                }
                accept_result = self.listener.accept() => {
                    let (stream, addr) = accept_result.map_err(|e| Error::IoError(e.kind()))?;
                    metrics::PEER_CONNECTIONS
                        .with_label_values(&["inbound", "accepted"])
                        .inc();
                    debug!(remote = %addr, "Accepted peer connection");

                    let node = Arc::clone(&self.node);
                    let compress = self.node.config().compression;
                    tokio::spawn(async move {
                        metrics::ACTIVE_PEER_CONNECTIONS.inc();
                        let conn = PeerConnection::accepted(stream, addr, compress);
                        if let Err(e) = serve_peer(node, conn).await {
                            debug!(remote = %addr, error = %e, "Peer session ended");
                        }
                        metrics::ACTIVE_PEER_CONNECTIONS.dec();
                    });
                }
            }
        }
    }

    /// Accept and serve exactly one connection (useful for testing).
    pub async fn accept_one(&self) -> HaResult<()> {
        let (stream, addr) = self.listener.accept().await.map_err(HaError::Io)?;
        let conn = PeerConnection::accepted(stream, addr, self.node.config().compression);
        serve_peer(Arc::clone(&self.node), conn).await
    }

    /// Signal every task on the channel to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(router) = &self.router_task {
            router.abort();
        }
    }

    /// Links still running (drops to zero after shutdown completes).
    pub fn active_links(&self) -> usize {
        self.link_tasks.iter().filter(|t| !t.is_finished()).count()
    }
}

impl std::fmt::Debug for PeerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerChannel")
            .field("node", &self.node.config().node_id)
            .field("links", &self.link_tasks.len())
            .finish()
    }
}

/// Serve one authenticated inbound connection until it closes.
///
/// The handshake gates everything: the first frame must be AUTH and every
/// later frame must come from the peer that authenticated.
async fn serve_peer(node: Arc<HaNode>, mut conn: PeerConnection) -> HaResult<()> {
    let read_timeout = node.config().frame_read_timeout;
    let remote = conn.peer_addr().to_string();

    let first = match conn.read_frame(read_timeout).await {
        Ok(frame) => frame,
        Err(Error::MissingData(_)) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let peer = auth::verify_handshake(&first, node.config(), &remote)?;
    reply_ack(&node, &mut conn, Sequence::new(0)).await?;

    loop {
        let frame = match conn.read_frame(read_timeout).await {
            Ok(frame) => frame,
            Err(Error::MissingData(_)) => {
                debug!(peer = %peer, "Peer disconnected");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if frame.sender != peer {
            return Err(HaError::Protocol(format!(
                "frame sender {} does not match authenticated peer {}",
                frame.sender, peer
            )));
        }

        match frame.payload {
            FramePayload::Heartbeat { role, .. } => {
                node.view()
                    .tracker()
                    .record_heartbeat(&peer, frame.sequence, role, frame.epoch);
                let applied = node.store().highwater(&peer);
                reply_ack(&node, &mut conn, applied).await?;
            }
            FramePayload::Change(record) => {
                let applied = node.apply_incoming(record).await?;
                reply_ack(&node, &mut conn, applied).await?;
            }
            FramePayload::ResyncRequest { reason } => {
                info!(peer = %peer, reason, "Serving snapshot");
                let (snapshot, checksum) = node.snapshot_for_peer().await?;
                let reply = Frame {
                    sender: node.config().node_id.clone(),
                    epoch: node.epoch(),
                    sequence: Sequence::new(0),
                    payload: FramePayload::ResyncData { checksum, snapshot },
                };
                conn.write_frame(&reply).await?;
            }
            // Re-authentication is harmless; the secret already matched once
            FramePayload::Auth { .. } => {
                reply_ack(&node, &mut conn, Sequence::new(0)).await?;
            }
            FramePayload::Ack | FramePayload::ResyncData { .. } => {
                return Err(HaError::Protocol(format!(
                    "unexpected {:?} frame on inbound link from {}",
                    frame.frame_type(),
                    peer
                )));
            }
        }
    }
}

async fn reply_ack(node: &HaNode, conn: &mut PeerConnection, applied: Sequence) -> HaResult<()> {
    let ack = Frame::ack(node.config().node_id.clone(), node.epoch(), applied);
    conn.write_frame(&ack).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{HaConfig, PeerConfig, QuorumMode};
    use crate::protocol::FrameType;
    use crate::types::{ChangeRecord, EntityKey, Epoch, Role};
    use bytes::Bytes;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn config(id: &str, peer: &str) -> HaConfig {
        HaConfig {
            node_id: NodeId::from(id),
            listen_addr: "127.0.0.1:0".to_string(),
            shared_secret: "secret".to_string(),
            quorum_mode: QuorumMode::None,
            peers: vec![PeerConfig {
                id: NodeId::from(peer),
                addr: "127.0.0.1:1".to_string(),
                priority: 200,
                weight: 1,
                witness: false,
            }],
            startup_grace: Duration::from_secs(60),
            ..HaConfig::default()
        }
    }

    /// Node plus a raw client socket connected to its listener.
    async fn node_and_client(id: &str, peer: &str) -> (Arc<HaNode>, PeerConnection) {
        let node = Arc::new(HaNode::start(config(id, peer)).unwrap());
        let channel = PeerChannel::bind(Arc::clone(&node)).await.unwrap();
        let addr = channel.local_addr().unwrap();

        let server_node = Arc::clone(&node);
        tokio::spawn(async move {
            let _ = channel.accept_one().await;
            let _ = server_node; // keep the node alive for the session
        });

        let client = PeerConnection::connect(&addr.to_string(), false)
            .await
            .unwrap();
        (node, client)
    }

    fn auth_as(sender: &str, secret: &str) -> Frame {
        Frame {
            sender: NodeId::from(sender),
            epoch: Epoch::new(0),
            sequence: Sequence::new(0),
            payload: FramePayload::Auth {
                secret: secret.to_string(),
            },
        }
    }

    fn change(origin: &str, seq: u64, key: &str, value: &[u8]) -> Frame {
        Frame::change(
            NodeId::from(origin),
            ChangeRecord {
                origin: NodeId::from(origin),
                sequence: Sequence::new(seq),
                epoch: Epoch::new(1),
                entity_key: EntityKey::new("dhcp-lease", key),
                old_value: None,
                new_value: Some(Bytes::copy_from_slice(value)),
                timestamp_ms: seq,
            },
        )
    }

    #[tokio::test]
    async fn test_handshake_then_heartbeat() {
        let (node, mut client) = node_and_client("fw-a", "fw-b").await;

        let reply = client
            .call(&auth_as("fw-b", "secret"), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(reply.frame_type(), FrameType::Ack);

        let hb = Frame::heartbeat(
            NodeId::from("fw-b"),
            Epoch::new(1),
            Sequence::new(1),
            Role::Backup,
            0,
        );
        let reply = client.call(&hb, TIMEOUT).await.unwrap();
        assert_eq!(reply.frame_type(), FrameType::Ack);

        // The heartbeat fed the tracker
        assert!(node.view().tracker().is_reachable(&NodeId::from("fw-b")));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_wrong_secret_closes_connection() {
        let (node, mut client) = node_and_client("fw-a", "fw-b").await;

        client
            .write_frame(&auth_as("fw-b", "wrong"))
            .await
            .unwrap();
        // The server closes without an ack
        assert!(client.read_frame(TIMEOUT).await.is_err());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_frames_before_auth_rejected() {
        let (node, mut client) = node_and_client("fw-a", "fw-b").await;

        let hb = Frame::heartbeat(
            NodeId::from("fw-b"),
            Epoch::new(1),
            Sequence::new(1),
            Role::Backup,
            0,
        );
        client.write_frame(&hb).await.unwrap();
        assert!(client.read_frame(TIMEOUT).await.is_err());
        // The rejected heartbeat never reached the tracker: the peer still
        // advertises its registration defaults
        let tracker = node.view().tracker();
        assert_eq!(
            tracker.advertised_role(&NodeId::from("fw-b")),
            Some(Role::Init)
        );
        assert_eq!(
            tracker.advertised_epoch(&NodeId::from("fw-b")),
            Some(Epoch::new(0))
        );
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_change_records_acked_cumulatively() {
        let (node, mut client) = node_and_client("fw-a", "fw-b").await;
        client
            .call(&auth_as("fw-b", "secret"), TIMEOUT)
            .await
            .unwrap();

        let reply = client
            .call(&change("fw-b", 1, "k1", b"v1"), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(reply.sequence, Sequence::new(1));

        // Out of order: sequence 3 buffers, the ack stays at 1
        let reply = client
            .call(&change("fw-b", 3, "k3", b"v3"), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(reply.sequence, Sequence::new(1));

        // Sequence 2 releases both
        let reply = client
            .call(&change("fw-b", 2, "k2", b"v2"), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(reply.sequence, Sequence::new(3));

        assert_eq!(
            node.store()
                .get(&EntityKey::new("dhcp-lease", "k3"))
                .await
                .unwrap(),
            Some(Bytes::from_static(b"v3"))
        );
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_resync_request_served_with_valid_checksum() {
        let (node, mut client) = node_and_client("fw-a", "fw-b").await;
        node.store()
            .set(EntityKey::new("nat-rule", "r1"), Bytes::from_static(b"allow"))
            .await
            .unwrap();

        client
            .call(&auth_as("fw-b", "secret"), TIMEOUT)
            .await
            .unwrap();

        let request = Frame {
            sender: NodeId::from("fw-b"),
            epoch: Epoch::new(0),
            sequence: Sequence::new(0),
            payload: FramePayload::ResyncRequest {
                reason: "startup".to_string(),
            },
        };
        let reply = client.call(&request, TIMEOUT).await.unwrap();
        match reply.payload {
            FramePayload::ResyncData { checksum, snapshot } => {
                assert_eq!(crate::protocol::snapshot_checksum(&snapshot), checksum);
            }
            other => panic!("expected resync data, got {:?}", other),
        }
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_sender_spoofing_closes_connection() {
        let (node, mut client) = node_and_client("fw-a", "fw-b").await;
        client
            .call(&auth_as("fw-b", "secret"), TIMEOUT)
            .await
            .unwrap();

        // Authenticated as fw-b, but claims to be fw-c
        let hb = Frame::heartbeat(
            NodeId::from("fw-c"),
            Epoch::new(1),
            Sequence::new(1),
            Role::Backup,
            0,
        );
        client.write_frame(&hb).await.unwrap();
        assert!(client.read_frame(TIMEOUT).await.is_err());
        node.shutdown().await;
    }
}
