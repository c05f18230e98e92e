//! Error types for state operations

use thiserror::Error;

/// Errors raised while hashing, diffing, capturing or restoring shell state
#[derive(Debug, Error)]
pub enum StateError {
    /// Canonical encoding failed
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// A diff was applied to a state other than its base
    #[error("Base hash mismatch: diff expects {expected}, base is {actual}")]
    BaseHashMismatch {
        /// Hash recorded in the diff
        expected: String,
        /// Hash of the state the diff was applied to
        actual: String,
    },

    /// Two states belong to different version families
    #[error("Version mismatch: {base} vs {target}")]
    VersionMismatch {
        /// Version of the base state
        base: String,
        /// Version of the other state
        target: String,
    },

    /// A version banner could not be parsed
    #[error("Invalid version string: {0:?}")]
    InvalidVersion(String),

    /// Capture output did not contain the start marker
    #[error("Capture output is missing the start marker")]
    MissingStartMarker,

    /// Capture output did not contain the end marker
    #[error("Capture output is missing the end marker")]
    MissingEndMarker,

    /// Capture output had the wrong number of sections
    #[error("Capture output has {found} sections, expected {expected}")]
    SectionCount {
        /// Sections required
        expected: usize,
        /// Sections present
        found: usize,
    },

    /// Captured bytes that must be text were not valid UTF-8
    #[error("Non-UTF-8 bytes in {0}")]
    NonUtf8(String),

    /// Capture output was structurally invalid
    #[error("Invalid capture output: {0}")]
    InvalidCapture(String),
}

impl StateError {
    /// Whether this error came from a version family check
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, Self::VersionMismatch { .. })
    }
}
