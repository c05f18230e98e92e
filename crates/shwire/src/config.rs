//! Client configuration

use shwire_proto::MAX_FRAME_SIZE;
use std::time::Duration;

/// Tunables for a [`Client`](crate::Client)
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for the handshake and for each rpc answer
    pub request_timeout: Duration,
    /// Largest frame accepted from the server
    pub max_frame_size: usize,
    /// Size of the chunks a file write is split into
    pub write_chunk_size: usize,
    /// Pause between two chunks of a file write, so the server's bounded
    /// write queue keeps draining
    pub write_chunk_delay: Duration,
    /// How long a spawned local server gets to exit after shutdown
    pub shutdown_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_frame_size: MAX_FRAME_SIZE,
            write_chunk_size: 32 * 1024,
            write_chunk_delay: Duration::from_millis(1),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}
