//! # shwire
//!
//! Client driver for the shwire protocol.
//!
//! A [`Client`] speaks to a `shwire-server` over any duplex byte stream. It
//! correlates rpc answers with their requests, fans command packets out to a
//! caller-supplied [`CommandSink`], and keeps its own shell state cache so the
//! final-state diffs the server returns can be applied locally.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use shwire_proto as proto;
pub use shwire_state as state;

/// Error types for the client
pub mod error;

/// Client configuration
pub mod config;

/// Command output sinks
pub mod sink;

/// Local server processes
pub mod transport;

/// Protocol driver
pub mod client;

pub use client::{Client, Completions, FileStream, RunRequest};
pub use config::ClientConfig;
pub use error::ShwireError;
pub use sink::{ChannelSink, CommandDone, CommandEvent, CommandSink};
pub use transport::LocalTransport;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ShwireError>;
