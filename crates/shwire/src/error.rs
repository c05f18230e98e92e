//! Error types for the client

use shwire_proto::{ErrorDetails, ProtocolError};
use shwire_state::StateError;
use std::time::Duration;
use thiserror::Error;

/// Main error type for client operations
#[derive(Debug, Error)]
pub enum ShwireError {
    /// Reading from or writing to the transport failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The peer sent something the client cannot use
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered a request with an error
    #[error("Server error ({:?}): {}", .0.code, .0.message)]
    Remote(ErrorDetails),

    /// A file transfer failed after it started
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Timeout errors
    #[error("Timeout after {duration:?}")]
    Timeout {
        /// Duration that was exceeded
        duration: Duration,
    },

    /// A state referenced by hash is not in the local cache
    #[error("Unknown state: {0}")]
    UnknownState(String),

    /// Hashing, diffing or patching a state failed
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection is gone
    #[error("Connection error: {0}")]
    Connection(String),
}

impl ShwireError {
    /// Wire error details, when the server sent them
    pub fn remote_details(&self) -> Option<&ErrorDetails> {
        match self {
            Self::Remote(details) => Some(details),
            _ => None,
        }
    }
}

impl From<ProtocolError> for ShwireError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(msg) => Self::Transport(msg),
            other => Self::Protocol(other.to_string()),
        }
    }
}
