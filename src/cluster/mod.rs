//! Coordination and state replication for a two-to-few-node appliance
//! cluster.
//!
//! This module is the control plane of the engine:
//! - **Failure detection**: heartbeat tracking with suspicion before
//!   declaration ([`heartbeat`])
//! - **Arbitration**: quorum-gated primary election with epochs and
//!   split-brain fencing ([`quorum`], [`arbiter`], [`fencing`])
//! - **Replication**: per-origin ordered change records with replay
//!   suppression and snapshot resync ([`store`], [`replication`],
//!   [`resync`])
//! - **Reconciliation**: deterministic merge of divergent state after a
//!   partition heals ([`reconciler`])
//! - **Identity migration**: virtual address/MAC ownership with
//!   gratuitous announcements ([`virtual_ip`])
//!
//! # Architecture
//!
//! ```text
//!    ┌──────────┐ heartbeats  ┌──────────┐
//!    │   fw-a   │◄───────────►│   fw-b   │
//!    │ PRIMARY  │   changes   │  BACKUP  │
//!    │ owns VIP │────────────►│ replicas │
//!    └────┬─────┘    acks     └────┬─────┘
//!         │        ┌──────────┐    │
//!         └───────►│ witness  │◄───┘
//!      (votes only)└──────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use carpaccio::cluster::{HaConfig, HaNode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HaConfig::from_env()?;
//!     let node = HaNode::start(config)?;
//!     // wire the peer link layer, then serve until shutdown
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod arbiter;
mod config;
mod error;
pub mod fencing;
pub mod heartbeat;
pub mod metrics;
mod node;
pub mod quorum;
pub mod reachability;
mod reconciler;
mod replication;
mod resync;
pub mod retry;
mod store;
mod view;
pub mod virtual_ip;

pub use arbiter::{HaEvent, RoleArbiter, RoleState};
pub use config::{
    FailbackMode, HaConfig, HaProfile, PeerConfig, QuorumMode, ReconcileStrategy,
    VirtualResourceConfig,
};
pub use error::{HaError, HaResult};
pub use fencing::{FencedState, FencingAgent, LoggingFencingAgent};
pub use heartbeat::{HeartbeatOutcome, PeerHealthState, PeerStateChange, PeerTracker};
pub use node::{HaNode, NodeStatus};
pub use quorum::{QuorumDecision, QuorumEvaluator, StaticWeights, WeightProvider};
pub use reachability::{UplinkEvent, UplinkProber};
pub use reconciler::{Conflict, ConflictOutcome, ConflictSummary, ReconcileReport, Reconciler};
pub use replication::{OfferOutcome, OutboundQueue, ReorderBuffer};
pub use resync::{record_resync, ResyncTrigger, Snapshot};
pub use store::{ApplyOutcome, MemoryStateStore, ReplicatedStore, StateStore};
pub use view::{ClusterView, MemberInfo, PeerStatus};
pub use virtual_ip::{LoggingBackend, NetworkBackend, VirtualIdentityManager};
