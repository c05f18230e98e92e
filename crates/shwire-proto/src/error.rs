//! Error types for protocol operations

use crate::packet::{ErrorCode, ErrorDetails};
use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Reading from or writing to the transport failed
    #[error("Transport error: {0}")]
    Io(String),

    /// A packet could not be serialized
    #[error("Encode error: {0}")]
    Encode(String),

    /// A complete frame held a body that does not decode to a packet
    #[error("Decode error: {0}")]
    Decode(String),

    /// The stream ended in the middle of a frame
    #[error("Stream ended inside a frame")]
    TruncatedFrame,

    /// Frame too large
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Malformed command key
    #[error("Invalid command key: {0:?}")]
    InvalidCommandKey(String),
}

impl ProtocolError {
    /// Whether the stream can no longer be used after this error.
    ///
    /// Decode errors consume exactly one frame and leave the stream in sync;
    /// everything else on the read path leaves it unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::TruncatedFrame | Self::FrameTooLarge { .. })
    }
}

impl From<ProtocolError> for ErrorDetails {
    fn from(error: ProtocolError) -> Self {
        let code = match &error {
            ProtocolError::FrameTooLarge { .. } => ErrorCode::ResourceExhausted,
            ProtocolError::Io(_) => ErrorCode::Internal,
            _ => ErrorCode::InvalidRequest,
        };
        ErrorDetails::new(code, error.to_string())
    }
}
