//! # Shwire Server
//!
//! Runs commands on behalf of a shwire client while carrying the interactive
//! shell's state from one command to the next. The server speaks the packet
//! protocol over any byte-stream pair, usually its own stdin/stdout.

#![warn(missing_docs)]

/// Server configuration
pub mod config;

/// Error types for server operations
pub mod error;

/// Outbound packet channel and writer task
pub mod sender;

/// Pseudo-terminal helpers
pub mod pty;

/// Assembly of runs that wait for their input
pub mod builder;

/// Live process table
pub mod process;

/// Per-command executor
pub mod executor;

/// Follow-up handler registry and reaper
pub mod registry;

/// File streaming and writing
pub mod files;

/// One-shot rpc handlers
pub mod handlers;

/// Server loop and packet demux
pub mod server;

pub use config::{ServerConfig, ShellPaths};
pub use error::{ExecError, RegistryError, ServerError, TransferError};
pub use server::Server;
