//! Runtime separation for the control plane and the replication plane.
//!
//! This module provides separate tokio runtimes for:
//! - **Control plane**: heartbeats, role arbitration, quorum evaluation,
//!   uplink probing
//! - **Replication plane**: change-record streaming, snapshot transfers,
//!   peer connections
//!
//! Separating these prevents a large snapshot transfer or a burst of change
//! records from starving the heartbeat loop, which would look like a peer
//! failure and trigger a spurious takeover.
//!
//! # Example
//!
//! ```rust,no_run
//! use carpaccio::runtime::{NodeRuntimes, RuntimeConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RuntimeConfig::default();
//!     let runtimes = NodeRuntimes::new(config)?;
//!
//!     // Run the node on the control plane, pass handles to components
//!     runtimes.block_on_control(async {
//!         // ... initialize and run the node with runtimes.handles()
//!     });
//!
//!     Ok(())
//! }
//! ```

use std::io;
use tokio::runtime::{Builder, Handle, Runtime};

/// Configuration for the dual-runtime setup.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker threads for the control plane.
    ///
    /// The control plane runs heartbeats, arbitration and probing. These
    /// are low-throughput but latency-sensitive tasks.
    ///
    /// Default: 2
    pub control_plane_threads: usize,

    /// Number of worker threads for the replication plane.
    ///
    /// The replication plane moves change records and snapshots between
    /// peers. These are throughput-heavy I/O tasks.
    ///
    /// Default: number of CPU cores
    pub replication_plane_threads: usize,

    /// Thread name prefix for control plane threads.
    ///
    /// Default: "ctrl"
    pub control_plane_thread_name: String,

    /// Thread name prefix for replication plane threads.
    ///
    /// Default: "repl"
    pub replication_plane_thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            control_plane_threads: 2,
            replication_plane_threads: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4),
            control_plane_thread_name: "ctrl".to_string(),
            replication_plane_thread_name: "repl".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Create configuration from environment variables.
    ///
    /// - `CONTROL_PLANE_THREADS`: Number of control plane worker threads (default: 2)
    /// - `REPLICATION_PLANE_THREADS`: Number of replication plane worker threads (default: num_cpus)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let control_plane_threads = std::env::var("CONTROL_PLANE_THREADS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.control_plane_threads);

        let replication_plane_threads = std::env::var("REPLICATION_PLANE_THREADS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.replication_plane_threads);

        Self {
            control_plane_threads,
            replication_plane_threads,
            ..defaults
        }
    }
}

/// Handles for both runtimes, enabling task spawning on the correct plane.
///
/// This struct is cheap to clone and can be passed to components that need
/// to spawn tasks on specific runtimes.
#[derive(Clone)]
pub struct RuntimeHandles {
    /// Control plane runtime handle for heartbeat and arbitration tasks.
    pub control: Handle,

    /// Replication plane runtime handle for peer connections and transfers.
    pub replication: Handle,
}

impl RuntimeHandles {
    /// Create handles from the current runtime.
    ///
    /// This creates handles that both point to the current tokio runtime,
    /// which is useful for tests or when runtime separation is not desired.
    pub fn from_current() -> Self {
        let current = Handle::current();
        Self {
            control: current.clone(),
            replication: current,
        }
    }
}

/// Owned runtimes for an HA node.
///
/// This struct owns both runtimes and should be held by the main entry point.
/// Use `handles()` to get cloneable handles for passing to components.
pub struct NodeRuntimes {
    /// Control plane runtime (heartbeats, arbitration, probing).
    control: Runtime,

    /// Replication plane runtime (peer connections, change streams, snapshots).
    replication: Runtime,

    /// Cloneable handles for spawning tasks.
    handles: RuntimeHandles,
}

impl NodeRuntimes {
    /// Create both runtimes with the given configuration.
    pub fn new(config: RuntimeConfig) -> io::Result<Self> {
        let control = Builder::new_multi_thread()
            .worker_threads(config.control_plane_threads)
            .thread_name(&config.control_plane_thread_name)
            .enable_all()
            .build()?;

        let replication = Builder::new_multi_thread()
            .worker_threads(config.replication_plane_threads)
            .thread_name(&config.replication_plane_thread_name)
            .enable_all()
            .build()?;

        let handles = RuntimeHandles {
            control: control.handle().clone(),
            replication: replication.handle().clone(),
        };

        Ok(Self {
            control,
            replication,
            handles,
        })
    }

    /// Get cloneable handles for spawning tasks on each runtime.
    pub fn handles(&self) -> RuntimeHandles {
        self.handles.clone()
    }

    /// Get a reference to the control plane runtime.
    pub fn control(&self) -> &Runtime {
        &self.control
    }

    /// Get a reference to the replication plane runtime.
    pub fn replication(&self) -> &Runtime {
        &self.replication
    }

    /// Block on a future using the control plane runtime.
    ///
    /// This is typically used in main() to run the node's async entry point.
    pub fn block_on_control<F: std::future::Future>(&self, future: F) -> F::Output {
        self.control.block_on(future)
    }

    /// Gracefully shutdown both runtimes.
    ///
    /// Shuts down the replication plane first (stops moving data), then the
    /// control plane so role arbitration can observe the drain.
    pub fn shutdown(self) {
        drop(self.replication);
        drop(self.control);
    }
}
