//! Fenced-state management for split-brain containment.
//!
//! A node fences itself when it can no longer prove it is safe to serve:
//! quorum lost while holding the serving role, or a dual-primary detected
//! after a partition heals. While fenced, the node refuses promotion,
//! releases its virtual resources, and marks locally generated state as
//! tentative until reconciliation completes.
//!
//! # Safety Properties
//!
//! 1. **Atomic transitions**: All state changes use `SeqCst` ordering for
//!    visibility across the control and replication planes
//! 2. **Timestamp tracking**: Entry time is recorded to detect re-entry
//!    during exit verification
//! 3. **Metrics integration**: All transitions are recorded to Prometheus
//!
//! # Example
//!
//! ```rust,no_run
//! use carpaccio::cluster::fencing::FencedState;
//! use std::sync::Arc;
//!
//! let fenced = Arc::new(FencedState::new());
//!
//! if fenced.enter("quorum_lost") {
//!     // release resources, demote
//! }
//!
//! let entered_at = fenced.entered_at();
//! // ... reconcile, re-verify quorum ...
//! if fenced.try_exit(entered_at, "reconciled") {
//!     // safe to rejoin arbitration
//! }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::{info, warn};

use super::error::HaResult;
use super::metrics;

/// Type-safe wrapper for the fenced flag and its entry timestamp.
#[derive(Debug)]
pub struct FencedState {
    /// Whether the node is currently fenced.
    active: AtomicBool,
    /// Timestamp (epoch millis) when fencing was entered.
    /// Used to detect re-entry during exit verification.
    entered_at_millis: AtomicU64,
}

impl Default for FencedState {
    fn default() -> Self {
        Self::new()
    }
}

impl FencedState {
    /// Create a new state (not fenced).
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            entered_at_millis: AtomicU64::new(0),
        }
    }

    /// Check if the node is currently fenced.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Get the timestamp (epoch millis) when fencing was entered.
    ///
    /// Returns 0 if not fenced.
    pub fn entered_at(&self) -> u64 {
        self.entered_at_millis.load(Ordering::SeqCst)
    }

    /// Enter the fenced state.
    ///
    /// Atomically sets the flag and records the entry timestamp. If already
    /// fenced this is a no-op and returns `false`.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn enter(&self, reason: &str) -> bool {
        // swap returns the previous value; if it was false, we just entered
        if !self.active.swap(true, Ordering::SeqCst) {
            let now_millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            self.entered_at_millis.store(now_millis, Ordering::SeqCst);
            warn!(reason, "Node FENCED");
            metrics::record_fencing(reason);
            true
        } else {
            false
        }
    }

    /// Try to exit the fenced state with re-entry detection.
    ///
    /// Detects the race where fencing was re-entered while exit
    /// verification (reconciliation, quorum re-check) was running:
    ///
    /// 1. Verification starts (fenced = true, entered_at = T1)
    /// 2. Quorum drops again, fencing re-enters (entered_at = T2)
    /// 3. Verification finishes against T1 state and tries to exit
    /// 4. The timestamp mismatch blocks the exit
    ///
    /// Uses compare_exchange to atomically verify and transition, so there
    /// is no TOCTOU window between checking `active` and clearing it.
    ///
    /// Returns `true` only when this call performed the exit.
    pub fn try_exit(&self, expected_entered_at: u64, exit_reason: &str) -> bool {
        let current_entered_at = self.entered_at_millis.load(Ordering::SeqCst);
        if current_entered_at != expected_entered_at {
            // Re-entered during verification; stay fenced
            return false;
        }

        match self.active.compare_exchange(
            true,  // expected: currently fenced
            false, // desired: unfenced
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                self.entered_at_millis.store(0, Ordering::SeqCst);
                info!(exit_reason, "Node unfenced");
                metrics::FENCED_STATE.set(0);
                true
            }
            // Not fenced, or another task exited concurrently
            Err(_) => false,
        }
    }

    /// Force exit without re-entry detection.
    ///
    /// Only safe where nothing can concurrently enter the fenced state,
    /// such as during shutdown or operator-forced recovery.
    pub fn force_exit(&self, exit_reason: &str) -> bool {
        if self.active.swap(false, Ordering::SeqCst) {
            self.entered_at_millis.store(0, Ordering::SeqCst);
            info!(exit_reason, forced = true, "Node unfenced");
            metrics::FENCED_STATE.set(0);
            true
        } else {
            false
        }
    }
}

/// Hook invoked around fencing transitions.
///
/// The arbiter drives the state machine; the agent performs the
/// environment-specific side effects (dropping firewall sessions, signaling
/// the data plane). The default [`LoggingFencingAgent`] only logs.
#[async_trait]
pub trait FencingAgent: Send + Sync {
    /// Called after the fenced flag is set and resources are released.
    async fn on_fence(&self, reason: &str) -> HaResult<()>;

    /// Called after the fenced flag is cleared.
    async fn on_unfence(&self) -> HaResult<()>;
}

/// Default agent: records transitions in the log and nothing else.
#[derive(Debug, Default, Clone)]
pub struct LoggingFencingAgent;

#[async_trait]
impl FencingAgent for LoggingFencingAgent {
    async fn on_fence(&self, reason: &str) -> HaResult<()> {
        info!(reason, "Fencing agent invoked (no-op backend)");
        Ok(())
    }

    async fn on_unfence(&self) -> HaResult<()> {
        info!("Unfencing agent invoked (no-op backend)");
        Ok(())
    }
}
