//! Live process table

use crate::error::ExecError;
use bytes::Bytes;
use shwire_proto::{CommandKey, InputPacket, SpecialInputPacket, WinSize};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Something to hand to a running command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessInput {
    /// Bytes for the pty
    Data(Bytes),
    /// End of input
    Eof,
    /// Signal by name
    Signal(String),
    /// Terminal resize
    Resize(WinSize),
}

impl ProcessInput {
    /// Inputs carried by an input packet, in delivery order
    pub fn from_input(packet: InputPacket) -> Vec<Self> {
        let mut inputs = Vec::with_capacity(2);
        if !packet.data.is_empty() {
            inputs.push(Self::Data(packet.data));
        }
        if packet.eof {
            inputs.push(Self::Eof);
        }
        inputs
    }

    /// Inputs carried by a special-input packet, in delivery order
    pub fn from_special(packet: SpecialInputPacket) -> Vec<Self> {
        let mut inputs = Vec::with_capacity(2);
        if let Some(size) = packet.win_size {
            inputs.push(Self::Resize(size));
        }
        if let Some(signal) = packet.signal {
            inputs.push(Self::Signal(signal));
        }
        inputs
    }
}

/// Input channels of live commands, one per command key
#[derive(Default)]
pub struct ProcessTable {
    procs: RwLock<HashMap<CommandKey, mpsc::UnboundedSender<ProcessInput>>>,
}

impl ProcessTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command; fails if the key is already live
    pub async fn try_insert(
        &self,
        ck: CommandKey,
    ) -> Result<mpsc::UnboundedReceiver<ProcessInput>, ExecError> {
        let mut procs = self.procs.write().await;
        if procs.contains_key(&ck) {
            return Err(ExecError::DuplicateKey(ck));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        procs.insert(ck, tx);
        Ok(rx)
    }

    /// Deliver inputs to a live command. Returns false, dropping the inputs,
    /// when the key is not live.
    pub async fn deliver(&self, ck: &CommandKey, inputs: Vec<ProcessInput>) -> bool {
        let procs = self.procs.read().await;
        let Some(tx) = procs.get(ck) else {
            debug!("Dropping input for unknown command {}", ck);
            return false;
        };
        for input in inputs {
            if tx.send(input).is_err() {
                debug!("Command {} stopped reading input", ck);
                return false;
            }
        }
        true
    }

    /// Remove a command, closing its input channel
    pub async fn remove(&self, ck: &CommandKey) -> bool {
        self.procs.write().await.remove(ck).is_some()
    }

    /// Whether a command is live
    pub async fn contains(&self, ck: &CommandKey) -> bool {
        self.procs.read().await.contains_key(ck)
    }

    /// Number of live commands
    pub async fn len(&self) -> usize {
        self.procs.read().await.len()
    }

    /// Whether no command is live
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
