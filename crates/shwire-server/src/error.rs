//! Error types for server operations

use shwire_proto::{CommandKey, ErrorCode, ErrorDetails, ProtocolError};
use shwire_state::StateError;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors that end the server loop
#[derive(Debug, Error)]
pub enum ServerError {
    /// The outbound writer is gone
    #[error("Packet writer closed")]
    WriterClosed,

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] ProtocolError),
}

/// Errors from running one command
#[derive(Debug, Error)]
pub enum ExecError {
    /// Another live command already uses this key
    #[error("Command {0} is already running")]
    DuplicateKey(CommandKey),

    /// The referenced base state is not cached
    #[error("Unknown shell state {0}")]
    UnknownState(String),

    /// The initiating state is unusable
    #[error("Invalid initiating state: {0}")]
    State(#[source] StateError),

    /// The process could not be started
    #[error("Failed to start command: {0}")]
    Start(String),

    /// Shell state capture failed
    #[error("State capture failed: {0}")]
    Capture(#[source] StateError),

    /// A time limit was exceeded
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// I/O failure after start
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Wire form of the error
    pub fn to_details(&self) -> ErrorDetails {
        let code = match self {
            Self::DuplicateKey(_) => ErrorCode::InvalidRequest,
            Self::UnknownState(_) => ErrorCode::NotFound,
            Self::State(e) if e.is_version_mismatch() => ErrorCode::VersionMismatch,
            Self::State(_) => ErrorCode::InvalidRequest,
            Self::Start(_) => ErrorCode::StartFailed,
            Self::Capture(_) => ErrorCode::CaptureFailed,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Io(_) => ErrorCode::Internal,
        };
        ErrorDetails::new(code, self.to_string())
    }
}

/// Follow-up handler registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A handler is already registered for the id
    #[error("Handler already registered for request {0}")]
    Duplicate(Uuid),

    /// Nothing is registered for the id
    #[error("No handler for request {0}")]
    NoHandler(Uuid),

    /// The handler rejected the follow-up
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// File transfer errors
#[derive(Debug, Error)]
pub enum TransferError {
    /// Too many chunks queued ahead of the writer
    #[error("Write queue full ({depth} chunks pending)")]
    QueueFull {
        /// Configured queue depth
        depth: usize,
    },

    /// The transfer already finished
    #[error("Transfer closed")]
    Closed,

    /// The transfer went idle past its deadline
    #[error("Transfer expired")]
    Expired,

    /// The peer reported a failure
    #[error("Remote error: {0}")]
    Remote(String),

    /// Malformed byte range
    #[error("Invalid byte range: {0}")]
    InvalidRange(String),

    /// Local file system failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Wire form of the error
    pub fn to_details(&self) -> ErrorDetails {
        let code = match self {
            Self::QueueFull { .. } => ErrorCode::ResourceExhausted,
            Self::Closed => ErrorCode::InvalidRequest,
            Self::Expired => ErrorCode::Timeout,
            Self::Remote(_) => ErrorCode::Internal,
            Self::InvalidRange(_) => ErrorCode::InvalidRequest,
            Self::Io(e) => io_error_code(e),
        };
        ErrorDetails::new(code, self.to_string())
    }
}

/// Wire error code for a file system failure
pub fn io_error_code(error: &std::io::Error) -> ErrorCode {
    match error.kind() {
        std::io::ErrorKind::NotFound => ErrorCode::NotFound,
        std::io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
        _ => ErrorCode::Internal,
    }
}
