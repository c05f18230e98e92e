//! # Shwire Shell State
//!
//! Canonical shell state snapshots, content hashing, incremental diff/patch,
//! capture-script generation and parsing, and rc synthesis for bash and zsh.

#![warn(missing_docs)]

/// Shell state model and hashing
pub mod model;

/// Generic ordered map diffs
pub mod mapdiff;

/// State diff and patch
pub mod diff;

/// Capture script generation and output parsing
pub mod capture;

/// RC script synthesis
pub mod rc;

/// Content-addressed state cache
pub mod cache;

/// Flavor-specific shell knowledge
pub mod shell;

/// Error types for state operations
pub mod error;

mod decl;
mod lex;

pub use model::{
    AliasKind, PromptInfo, ShellAlias, ShellFunc, ShellState, ShellType, ShellVar, VarFlags,
    VarValue, VersionFamily,
};
pub use mapdiff::MapDiff;
pub use diff::ShellStateDiff;
pub use capture::{parse_capture, CaptureMarkers, SECTION_COUNT};
pub use rc::{exit_trap, synthesize_rc};
pub use cache::ShellStateMap;
pub use error::StateError;
