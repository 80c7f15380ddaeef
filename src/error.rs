//! Crate & protocol level errors.
//!
//! The crate uses a two-layer error hierarchy:
//!
//! ## Protocol Layer (`crate::error`)
//!
//! - [`Error`]: connection and frame-parsing errors on the peer channel
//!
//! ## Coordination Layer (`crate::cluster::error`)
//!
//! - [`HaError`]: the rich coordination errors (quorum loss, stale epochs,
//!   snapshot corruption, virtual-resource failures, ...)
//!
//! ## Conversion
//!
//! [`HaError`] converts to [`Error`] via a `From` impl so coordination
//! errors can propagate through the protocol layer when a connection task
//! has to die because of them.
//!
//! [`HaError`]: crate::cluster::HaError

use bytes::Bytes;
use std::{io, result};
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Protocol and connection level errors.
///
/// These are low-level errors that occur during network I/O, frame parsing
/// and connection management. For coordination errors, see
/// [`crate::cluster::HaError`].
#[derive(Clone, Debug, ThisError)]
pub enum Error {
    /// An error in the network.
    #[error("IO error: {0:?}")]
    IoError(io::ErrorKind),

    /// Could not parse the data.
    #[error("Parsing error: invalid data ({} bytes)", .0.len())]
    ParsingError(Bytes),

    /// Missing data or connection closed.
    #[error("Missing data: {0}")]
    MissingData(String),

    /// A frame exceeded the configured size limit.
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::IoError(a), Error::IoError(b)) => a == b,
            (Error::ParsingError(a), Error::ParsingError(b)) => a == b,
            (Error::MissingData(a), Error::MissingData(b)) => a == b,
            (Error::FrameTooLarge(a), Error::FrameTooLarge(b)) => a == b,
            (Error::Config(a), Error::Config(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e.kind())
    }
}

impl From<crate::cluster::HaError> for Error {
    fn from(e: crate::cluster::HaError) -> Self {
        use crate::cluster::HaError;
        match e {
            HaError::Io(io_err) => Error::IoError(io_err.kind()),
            HaError::Config(msg) => Error::Config(msg),
            other => Error::Config(other.to_string()),
        }
    }
}
