//! Error types for the coordination layer.
//!
//! # Error Handling Patterns
//!
//! This crate uses two error handling patterns based on operation criticality:
//!
//! ## Fail-Fast (Propagate Errors)
//!
//! Used for operations where failure indicates a serious problem:
//! - Role promotion and demotion
//! - Virtual resource assignment (addresses must not be double-owned)
//! - Applying replicated change records
//! - Snapshot installation
//!
//! ## Best-Effort (Log and Continue)
//!
//! Used for operations where partial failure is acceptable:
//! - Heartbeat sends (the next tick retries anyway)
//! - Metric collection
//! - Gratuitous announcements after the first one succeeded
//! - Conflict listing for operator inspection
//!
//! ## Guidelines
//!
//! - **Role transitions**: Always fail-fast; a half-promoted node is worse
//!   than a backup
//! - **Replication receive path**: Fail-fast on corruption, best-effort on
//!   transient link errors
//! - **Background probes**: Best-effort with logging for observability

use thiserror::Error;

use crate::types::{Epoch, NodeId, Sequence};

/// Result type for coordination operations.
pub type HaResult<T> = Result<T, HaError>;

/// Errors that can occur in the coordination layer.
#[derive(Debug, Error)]
pub enum HaError {
    /// Transient network failure talking to a peer.
    #[error("Transient network error for peer {peer}: {message}")]
    TransientNetwork { peer: NodeId, message: String },

    /// Peer failed the pre-shared-key handshake.
    #[error("Authentication failed for peer at {remote}")]
    Authentication { remote: String },

    /// A change record arrived with a stale epoch.
    #[error(
        "Stale epoch from {origin}: record epoch {record_epoch}, current epoch {current_epoch}"
    )]
    StaleEpoch {
        origin: NodeId,
        record_epoch: Epoch,
        current_epoch: Epoch,
    },

    /// A gap in an origin's change sequence that the reorder buffer
    /// could not bridge. The stream from that origin needs a resync.
    #[error("Sequence gap from {origin}: expected {expected}, buffer saw up to {highest_buffered}")]
    SequenceGap {
        origin: NodeId,
        expected: Sequence,
        highest_buffered: Sequence,
    },

    /// Snapshot checksum verification failed.
    #[error(
        "Snapshot from {origin} is corrupt: expected checksum {expected:#010x}, computed {computed:#010x}"
    )]
    SnapshotCorrupt {
        origin: NodeId,
        expected: u32,
        computed: u32,
    },

    /// A write conflict that requires (or awaits) resolution.
    #[error("Unresolved conflict on {entity}: {message}")]
    Conflict { entity: String, message: String },

    /// Quorum is lost; serving-role transitions are forbidden.
    #[error("Quorum lost: {reachable} of {total} votes reachable")]
    QuorumLost { reachable: u32, total: u32 },

    /// A virtual resource operation (address assign/release, announcement)
    /// failed against the network backend.
    #[error("Virtual resource error for {resource}: {message}")]
    VirtualResource { resource: String, message: String },

    /// This node is fenced; the attempted operation is refused.
    #[error("Node is fenced")]
    Fenced,

    /// An internal channel closed; the owning task is gone.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol-level error (wraps crate::error::Error).
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl HaError {
    /// Check if this error is retriable (transient infrastructure issue).
    ///
    /// Retriable errors should be retried with one of the policies in
    /// [`crate::cluster::retry`]; the rest need intervention or a resync.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        match self {
            HaError::TransientNetwork { .. } => true,
            HaError::VirtualResource { .. } => true,
            HaError::Io(e) => Self::is_io_error_retryable(e),

            // These are NOT retriable - fix the underlying issue
            HaError::Authentication { .. } => false,
            HaError::StaleEpoch { .. } => false,
            HaError::SequenceGap { .. } => false,
            HaError::SnapshotCorrupt { .. } => false,
            HaError::Conflict { .. } => false,
            HaError::QuorumLost { .. } => false,
            HaError::Fenced => false,
            HaError::ChannelClosed(_) => false,
            HaError::Serde(_) => false,
            HaError::Config(_) => false,
            HaError::Protocol(_) => false,
        }
    }

    /// Check if this error means the peer stream needs a full resync.
    #[inline]
    pub fn needs_resync(&self) -> bool {
        matches!(
            self,
            HaError::SequenceGap { .. } | HaError::SnapshotCorrupt { .. }
        )
    }

    /// Check if this is a split-brain safety error.
    ///
    /// These errors mean the node must not hold or take the serving role.
    #[inline]
    pub fn is_safety_error(&self) -> bool {
        matches!(self, HaError::Fenced | HaError::QuorumLost { .. })
    }

    /// Check if an IO error is retryable.
    fn is_io_error_retryable(e: &std::io::Error) -> bool {
        use std::io::ErrorKind;

        match e.kind() {
            // Definitely retryable
            ErrorKind::ConnectionRefused => true,
            ErrorKind::ConnectionReset => true,
            ErrorKind::ConnectionAborted => true,
            ErrorKind::NotConnected => true,
            ErrorKind::BrokenPipe => true,
            ErrorKind::TimedOut => true,
            ErrorKind::Interrupted => true,
            ErrorKind::WouldBlock => true,
            ErrorKind::WriteZero => true,
            ErrorKind::UnexpectedEof => true,

            // NOT retryable - permanent failures
            ErrorKind::NotFound => false,
            ErrorKind::PermissionDenied => false,
            ErrorKind::AlreadyExists => false,
            ErrorKind::InvalidInput => false,
            ErrorKind::InvalidData => false,
            ErrorKind::AddrInUse => false,
            ErrorKind::AddrNotAvailable => false,

            // Other errors - default to retryable
            _ => true,
        }
    }
}

impl From<crate::error::Error> for HaError {
    fn from(e: crate::error::Error) -> Self {
        match e {
            crate::error::Error::IoError(kind) => HaError::Io(std::io::Error::from(kind)),
            crate::error::Error::Config(msg) => HaError::Config(msg),
            other => HaError::Protocol(other.to_string()),
        }
    }
}
