//! Command output sinks
//!
//! The client hands every packet about a running command to the sink that
//! was supplied with its run. Calls for one command arrive in the order the
//! server sent them, and exactly one of [`CommandSink::on_done`] or
//! [`CommandSink::on_failed`] ends the sequence.

use async_trait::async_trait;
use bytes::Bytes;
use shwire_proto::{CommandKey, ErrorDetails};
use shwire_state::ShellState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Outcome of a command that ran to completion
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDone {
    /// Exit code of the shell
    pub exit_code: i32,
    /// Wall-clock time between spawn and exit
    pub duration: Duration,
    /// Hash of the final state, when it was recaptured
    pub state_hash: Option<String>,
    /// The final state, already patched into the local cache
    pub state: Option<Arc<ShellState>>,
    /// Why the final state is missing, when it is
    pub state_error: Option<String>,
}

/// Consumer of command lifecycle events
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// The process started
    async fn on_start(&self, ck: CommandKey, pid: u32);

    /// Output from the pty
    async fn on_data(&self, ck: CommandKey, data: Bytes);

    /// The command exited
    async fn on_done(&self, ck: CommandKey, done: CommandDone);

    /// The command was rejected or could not run
    async fn on_failed(&self, ck: CommandKey, error: ErrorDetails);
}

/// One sink call, as a value
#[derive(Debug, Clone, PartialEq)]
pub enum CommandEvent {
    /// See [`CommandSink::on_start`]
    Started {
        /// Process id
        pid: u32,
    },
    /// See [`CommandSink::on_data`]
    Data(Bytes),
    /// See [`CommandSink::on_done`]
    Done(CommandDone),
    /// See [`CommandSink::on_failed`]
    Failed(ErrorDetails),
}

impl CommandEvent {
    /// Whether no further events follow for the command
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Failed(_))
    }
}

/// A sink that forwards every call into a channel
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(CommandKey, CommandEvent)>,
}

impl ChannelSink {
    /// Create a sink and the receiver for its events
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(CommandKey, CommandEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, ck: CommandKey, event: CommandEvent) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.tx.send((ck, event));
    }
}

#[async_trait]
impl CommandSink for ChannelSink {
    async fn on_start(&self, ck: CommandKey, pid: u32) {
        self.forward(ck, CommandEvent::Started { pid });
    }

    async fn on_data(&self, ck: CommandKey, data: Bytes) {
        self.forward(ck, CommandEvent::Data(data));
    }

    async fn on_done(&self, ck: CommandKey, done: CommandDone) {
        self.forward(ck, CommandEvent::Done(done));
    }

    async fn on_failed(&self, ck: CommandKey, error: ErrorDetails) {
        self.forward(ck, CommandEvent::Failed(error));
    }
}
