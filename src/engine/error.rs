//! Engine error types.

use std::io;
use thiserror::Error;

use crate::config::ListenAddress;

/// Errors produced while building or running the multiplexing engine.
#[derive(Error, Debug)]
pub enum MuxError {
    #[error("Unknown protocol name '{0}'")]
    UnknownProtocol(String),

    #[error("Could not lookup host '{host}': {source}")]
    HostLookup {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("Unable to resolve hostname '{0}'")]
    NoHostRecords(String),

    #[error("Unable to listen on {address}: {source}")]
    ListenStart {
        address: ListenAddress,
        #[source]
        source: io::Error,
    },

    #[error("Failed to accept connection on {address}: {source}")]
    Accept {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Socket closed")]
    Closed,

    #[error("Setting deadlines is not supported")]
    DeadlinesNotSupported,

    #[error("Protocol '{protocol}' rejected remote '{remote}': {message}")]
    Configure {
        protocol: String,
        remote: String,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl MuxError {
    /// True for the error every blocked operation reports once its
    /// connection has been torn down or lost arbitration.
    pub fn is_closed(&self) -> bool {
        matches!(self, MuxError::Closed)
    }
}

/// Type alias for Results using MuxError
pub type Result<T> = std::result::Result<T, MuxError>;
