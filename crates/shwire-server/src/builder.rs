//! Assembly of runs that wait for their input
//!
//! A run with `wait_for_input` set is parked here while its input stream
//! arrives. Once the input reaches EOF the run is released together with the
//! buffered bytes. A parked run that never sees EOF expires.

use bytes::{Bytes, BytesMut};
use shwire_proto::{CommandKey, InputPacket, RunPacket};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// A run ready to execute
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyRun {
    /// The run request
    pub run: RunPacket,
    /// Input collected before start, fed to the command followed by EOF
    pub input: Option<Bytes>,
}

/// What happened to a run offered to the builder
#[derive(Debug)]
pub enum RunOutcome {
    /// Start it now
    Ready(ReadyRun),
    /// Parked until its input reaches EOF
    Held,
    /// A run with the same key is already parked; this one was refused
    Duplicate(RunPacket),
}

/// What happened to an input packet offered to the builder
#[derive(Debug)]
pub enum InputOutcome {
    /// No run is pending for the key; deliver to the live process instead
    NotPending(InputPacket),
    /// Buffered, still waiting for EOF
    Buffered,
    /// EOF reached, the run can start
    Ready(ReadyRun),
    /// Buffered input exceeded the limit; the run was dropped
    Overflow(RunPacket),
}

struct PendingRun {
    run: RunPacket,
    input: BytesMut,
    deadline: Instant,
}

/// Holds runs until their input is complete
pub struct RunBuilder {
    pending: HashMap<CommandKey, PendingRun>,
    input_limit: usize,
    timeout: Duration,
}

impl RunBuilder {
    /// Create a builder allowing `input_limit` buffered bytes per run and
    /// holding a run for at most `timeout`
    pub fn new(input_limit: usize, timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            input_limit,
            timeout,
        }
    }

    /// Offer a run
    pub fn add_run(&mut self, run: RunPacket, now: Instant) -> RunOutcome {
        if self.pending.contains_key(&run.ck) {
            return RunOutcome::Duplicate(run);
        }
        if !run.wait_for_input {
            return RunOutcome::Ready(ReadyRun { run, input: None });
        }
        debug!("Holding run {} until its input is complete", run.ck);
        self.pending.insert(
            run.ck,
            PendingRun {
                run,
                input: BytesMut::new(),
                deadline: now + self.timeout,
            },
        );
        RunOutcome::Held
    }

    /// Offer an input packet
    pub fn add_input(&mut self, input: InputPacket) -> InputOutcome {
        let Some(pending) = self.pending.get_mut(&input.ck) else {
            return InputOutcome::NotPending(input);
        };

        if pending.input.len() + input.data.len() > self.input_limit {
            return match self.pending.remove(&input.ck) {
                Some(pending) => InputOutcome::Overflow(pending.run),
                None => InputOutcome::NotPending(input),
            };
        }
        pending.input.extend_from_slice(&input.data);

        if !input.eof {
            return InputOutcome::Buffered;
        }
        match self.pending.remove(&input.ck) {
            Some(pending) => InputOutcome::Ready(ReadyRun {
                run: pending.run,
                input: Some(pending.input.freeze()),
            }),
            None => InputOutcome::NotPending(input),
        }
    }

    /// Drop every run whose deadline is at or before `now`, returning them
    pub fn expire(&mut self, now: Instant) -> Vec<RunPacket> {
        let expired: Vec<CommandKey> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(ck, _)| *ck)
            .collect();
        expired
            .into_iter()
            .filter_map(|ck| self.pending.remove(&ck).map(|pending| pending.run))
            .collect()
    }

    /// Whether a run is waiting for `ck`
    pub fn is_pending(&self, ck: &CommandKey) -> bool {
        self.pending.contains_key(ck)
    }

    /// Number of waiting runs
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no run is waiting
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
