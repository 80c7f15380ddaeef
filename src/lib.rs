//! # Carpaccio
//! High-availability coordination and state replication for router and
//! firewall appliance pairs.
//!
//! Two (or a few) appliances share virtual addresses and runtime state:
//! one serves as primary while the others replicate its state changes and
//! stand ready to take over. This crate is the coordination engine behind
//! that: heartbeat failure detection, quorum-gated role arbitration with
//! epochs, split-brain fencing, ordered change-record replication with
//! snapshot resync, and deterministic reconciliation after a partition
//! heals. This is pure Rust all the way down; meaning memory safety, safe
//! concurrency, low resource usage, and speed.
//!
//! # Goals
//! - Easy to understand code
//! - Leverage best in class libraries such as [Tokio](https://tokio.rs/), [Nom](https://docs.rs/nom/latest/nom/)
//! - Never serve the same address from two nodes at once
//! - Be a building block for HA-capable network appliances
//!
//! ## Getting started
//! Install `carpaccio` to your rust project with `cargo add carpaccio` or include the following snippet in your `Cargo.toml` dependencies:
//! ```toml
//! carpaccio = "0.1"
//! ```
//!
//! ### Running a coordination node
//! [`HaNode`](cluster::HaNode) owns the arbitration and replication
//! machinery; [`PeerChannel`](peer::PeerChannel) is its network face.
//! Configuration comes from a validated profile or the environment.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use carpaccio::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let config = HaConfig::from_env()?;
//!     let node = Arc::new(HaNode::start(config)?);
//!
//!     let channel = PeerChannel::bind(Arc::clone(&node)).await?;
//!     channel.run().await?;
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! Platform side effects go through two seams: implement
//! [`NetworkBackend`](cluster::NetworkBackend) to actually move virtual
//! addresses and send gratuitous ARP on your platform, and
//! [`FencingAgent`](cluster::FencingAgent) to stop traffic when the node
//! must fence. The defaults only log, which is what you want in tests.

#![forbid(unsafe_code)]

mod encode;
pub mod error;
mod parser;
pub mod protocol;
pub mod types;

pub mod cluster;
pub mod constants;
pub mod peer;
pub mod runtime;
pub mod telemetry;

pub mod prelude {
    //! Main exports for running a coordination node.
    //!
    //! # Node and channel
    //!
    //! [`HaNode`](crate::cluster::HaNode) is the coordination engine;
    //! [`PeerChannel`](crate::peer::PeerChannel) binds the listener and
    //! maintains the links to the configured peers. Start the node,
    //! bind the channel, run it.
    //!
    //! ## Example
    //! ```rust,no_run
    //! use std::sync::Arc;
    //! use carpaccio::prelude::*;
    //!
    //! #[tokio::main]
    //! async fn main() {
    //!     let config = HaConfig::from_profile(HaProfile::Production);
    //!     let node = Arc::new(HaNode::start(config).unwrap());
    //!     let channel = PeerChannel::bind(Arc::clone(&node)).await.unwrap();
    //!     channel.run().await.unwrap();
    //! }
    //! ```
    pub use crate::cluster::{
        FailbackMode, FencingAgent, HaConfig, HaError, HaNode, HaProfile, HaResult,
        NetworkBackend, NodeStatus, QuorumMode, ReconcileStrategy,
    };
    pub use crate::error::{Error, Result};
    pub use crate::peer::PeerChannel;
    pub use crate::protocol::{Frame, FramePayload, FrameType, snapshot_checksum};
    pub use crate::types::{ChangeRecord, EntityKey, Epoch, NodeId, Role, Sequence};

    pub use bytes;
}
