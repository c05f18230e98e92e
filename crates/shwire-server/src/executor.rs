//! Per-command executor
//!
//! Each run gets its own task. The task sources a synthesized rc script in a
//! fresh shell under a pty, streams output back as `CmdData`, and on exit
//! reads the state the exit trap captured, returning it as a diff against
//! the initiating state. A supervising task turns every outcome, panics
//! included, into exactly one terminal packet and always clears the
//! process table entry. Output still arriving once the terminal packet is
//! due is discarded, so the terminal packet is the last one for its key.

use crate::builder::ReadyRun;
use crate::config::ServerConfig;
use crate::error::ExecError;
use crate::process::{ProcessInput, ProcessTable};
use crate::pty::{self, PtyCommand, PtyRead};
use crate::sender::PacketSender;
use bytes::Bytes;
use portable_pty::MasterPty;
use shwire_proto::{
    CmdDataPacket, CmdDonePacket, CmdFinalPacket, CmdStartPacket, CommandKey, ErrorCode,
    ErrorDetails, Packet, RunPacket, StateInput,
};
use shwire_state::capture::parse_capture;
use shwire_state::shell::RTNSTATE_VAR;
use shwire_state::{
    exit_trap, synthesize_rc, CaptureMarkers, ShellState, ShellStateDiff, ShellStateMap,
    ShellType, StateError,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tempfile::{NamedTempFile, TempPath};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

/// Largest `CmdData` payload
pub const OUTPUT_CHUNK_SIZE: usize = 4096;

const EOF_BYTE: &[u8] = b"\x04";

/// Starts and supervises runs
#[derive(Clone)]
pub struct Executor {
    config: Arc<ServerConfig>,
    sender: PacketSender,
    processes: Arc<ProcessTable>,
    states: Arc<ShellStateMap>,
}

impl Executor {
    /// Create an executor
    pub fn new(
        config: Arc<ServerConfig>,
        sender: PacketSender,
        processes: Arc<ProcessTable>,
        states: Arc<ShellStateMap>,
    ) -> Self {
        Self {
            config,
            sender,
            processes,
            states,
        }
    }

    /// Register the run's key and start it in its own task.
    ///
    /// The key is live once this returns, so input sent right after the run
    /// reaches the command. Returns `None` when the key is already live; the
    /// run is then answered with an error response.
    pub async fn start(&self, ready: ReadyRun) -> Option<JoinHandle<()>> {
        let (ck, req_id) = (ready.run.ck, ready.run.req_id);
        let input_rx = match self.processes.try_insert(ck).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("Rejecting run {}: {}", ck, e);
                self.send(Packet::error_response(req_id, e.to_details())).await;
                return None;
            }
        };
        let executor = self.clone();
        Some(tokio::spawn(async move { executor.supervise(ready, input_rx).await }))
    }

    async fn supervise(self, ready: ReadyRun, input_rx: mpsc::UnboundedReceiver<ProcessInput>) {
        let ReadyRun { run, input } = ready;
        let (ck, req_id) = (run.ck, run.req_id);

        let initial = match resolve_state(&self.states, run.shell_type, run.state.clone()).await {
            Ok(state) => state,
            Err(e) => {
                warn!("Rejecting run {}: {}", ck, e);
                self.processes.remove(&ck).await;
                self.send(Packet::error_response(req_id, e.to_details())).await;
                return;
            }
        };

        let task = tokio::spawn(execute(self.clone(), run, initial, input, input_rx));
        let outcome = task.await;

        self.processes.remove(&ck).await;
        self.send(terminal_packet(ck, outcome)).await;
    }

    async fn send(&self, packet: Packet) {
        if let Err(e) = self.sender.send(packet).await {
            debug!("Dropping outbound packet: {}", e);
        }
    }
}

/// The one packet that ends a command
pub fn terminal_packet(ck: CommandKey, outcome: Result<Result<CmdDonePacket, ExecError>, JoinError>) -> Packet {
    match outcome {
        Ok(Ok(done)) => {
            info!("Command {} exited with {}", ck, done.exit_code);
            Packet::CmdDone(done)
        }
        Ok(Err(e)) => {
            warn!("Command {} failed: {}", ck, e);
            Packet::CmdFinal(CmdFinalPacket {
                ck,
                error: e.to_details(),
            })
        }
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!("Command {} panicked: {}", ck, message);
            Packet::CmdFinal(CmdFinalPacket {
                ck,
                error: ErrorDetails::new(ErrorCode::Panicked, format!("command task panicked: {}", message)),
            })
        }
        Err(_) => Packet::CmdFinal(CmdFinalPacket {
            ck,
            error: ErrorDetails::new(ErrorCode::Internal, "command task was cancelled"),
        }),
    }
}

/// Resolve a run's initiating state, caching it for later hash references
pub async fn resolve_state(
    states: &ShellStateMap,
    shell: ShellType,
    input: StateInput,
) -> Result<Arc<ShellState>, ExecError> {
    match input {
        StateInput::Full(state) => {
            check_flavor(shell, &state)?;
            let (_, state) = states.insert(shell, *state).await.map_err(ExecError::State)?;
            Ok(state)
        }
        StateInput::Hash(hash) => {
            let state = states
                .get(shell, &hash)
                .await
                .ok_or(ExecError::UnknownState(hash))?;
            check_flavor(shell, &state)?;
            Ok(state)
        }
        StateInput::Diff(diff) => {
            let base = states
                .get(shell, &diff.base_hash)
                .await
                .ok_or_else(|| ExecError::UnknownState(diff.base_hash.clone()))?;
            let state = diff.apply(&base).map_err(ExecError::State)?;
            check_flavor(shell, &state)?;
            let (_, state) = states.insert(shell, state).await.map_err(ExecError::State)?;
            Ok(state)
        }
    }
}

fn check_flavor(shell: ShellType, state: &ShellState) -> Result<(), ExecError> {
    let flavor = state.shell_type().map_err(ExecError::State)?;
    if flavor != shell {
        return Err(ExecError::State(StateError::VersionMismatch {
            base: shell.to_string(),
            target: state.version.clone(),
        }));
    }
    Ok(())
}

/// Path from a pty reader thread to the outbound queue that can be shut
/// once the command is over
#[derive(Clone)]
pub struct OutputGate {
    sender: Arc<Mutex<Option<PacketSender>>>,
}

impl OutputGate {
    /// Open gate in front of `sender`
    pub fn new(sender: PacketSender) -> Self {
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
        }
    }

    /// Queue a packet from a blocking thread. Returns false once the gate is
    /// shut or the writer is gone.
    pub fn blocking_forward(&self, packet: Packet) -> bool {
        let sender = self.sender.blocking_lock();
        match sender.as_ref() {
            Some(sender) => sender.blocking_send(packet).is_ok(),
            None => false,
        }
    }

    /// Shut the gate. Packets forwarded before this returns are queued ahead
    /// of anything sent afterwards; later ones are dropped.
    pub async fn shut(&self) {
        self.sender.lock().await.take();
    }
}

struct RunFiles {
    rc: NamedTempFile,
    rtn: TempPath,
}

fn prepare_files(shell: ShellType, state: &ShellState, markers: &CaptureMarkers) -> Result<RunFiles, ExecError> {
    let mut script = synthesize_rc(shell, state).map_err(ExecError::State)?;
    script.push_str(&exit_trap(shell, markers));

    let mut rc = tempfile::Builder::new()
        .prefix("shwire-rc-")
        .suffix(".sh")
        .tempfile()
        .map_err(|e| ExecError::Start(format!("rc file: {}", e)))?;
    rc.write_all(script.as_bytes())?;
    rc.flush()?;

    let rtn = tempfile::Builder::new()
        .prefix("shwire-rtn-")
        .tempfile()
        .map_err(|e| ExecError::Start(format!("state file: {}", e)))?
        .into_temp_path();

    Ok(RunFiles { rc, rtn })
}

fn shell_command(
    config: &ServerConfig,
    shell: ShellType,
    cwd: &str,
    files: &RunFiles,
    command: &str,
) -> Result<PtyCommand, ExecError> {
    let rc_path = path_str(files.rc.path())?;
    let rtn_path = path_str(&files.rtn)?;
    let rc_quoted = shlex::try_quote(rc_path).map_err(|e| ExecError::Start(e.to_string()))?;
    let script = format!(". {}\n{}\nexit $?\n", rc_quoted, command);

    let base = PtyCommand::new(config.shell_path(shell));
    let base = match shell {
        ShellType::Bash => base.arg("--noprofile").arg("--norc"),
        ShellType::Zsh => base.arg("-f"),
    };
    Ok(base
        .arg("-c")
        .arg(script)
        .cwd_if_exists(cwd)
        .env(RTNSTATE_VAR, rtn_path)
        .size(config.win_size))
}

fn path_str(path: &std::path::Path) -> Result<&str, ExecError> {
    path.to_str()
        .ok_or_else(|| ExecError::Start(format!("temp path is not UTF-8: {}", path.display())))
}

async fn execute(
    executor: Executor,
    run: RunPacket,
    initial: Arc<ShellState>,
    input: Option<Bytes>,
    input_rx: mpsc::UnboundedReceiver<ProcessInput>,
) -> Result<CmdDonePacket, ExecError> {
    let started = Instant::now();
    let (ck, shell) = (run.ck, run.shell_type);
    let markers = CaptureMarkers::generate();

    let files = prepare_files(shell, &initial, &markers)?;
    let command = shell_command(&executor.config, shell, &initial.cwd, &files, &run.command)?;
    let process = tokio::task::spawn_blocking(move || pty::spawn(&command))
        .await
        .map_err(|e| ExecError::Start(e.to_string()))??;

    let pid = process.pid;
    info!("Started command {} as pid {}", ck, pid);
    executor
        .send(Packet::CmdStart(CmdStartPacket {
            ck,
            req_id: run.req_id,
            pid,
        }))
        .await;

    let mut child = process.child;
    let (reader, writer, master) = (process.reader, process.writer, process.master);
    let gate = OutputGate::new(executor.sender.clone());
    let output = tokio::task::spawn_blocking({
        let gate = gate.clone();
        move || pump_output(reader, gate, ck)
    });
    tokio::task::spawn_blocking(move || pump_input(writer, master, pid, input, input_rx, ck));

    let waited = tokio::task::spawn_blocking(move || child.wait()).await;
    let drained = tokio::time::timeout(executor.config.exit_drain_grace, output).await;
    gate.shut().await;
    if drained.is_err() {
        // A background child still holds the terminal. Its reader thread
        // ends with that child, and everything it reads until then is dropped.
        debug!("Output of {} still open after exit, discarding the rest", ck);
    }
    let status = waited.map_err(|e| ExecError::Io(std::io::Error::other(e.to_string())))??;

    let (final_state, state_error) =
        match collect_final_state(&executor.states, shell, &initial, &files.rtn, &markers).await {
            Ok(diff) => (Some(diff), None),
            Err(e) => {
                warn!("No final state for {}: {}", ck, e);
                (None, Some(e.to_string()))
            }
        };

    Ok(CmdDonePacket {
        ck,
        exit_code: status.exit_code() as i32,
        duration_ms: started.elapsed().as_millis() as u64,
        final_state,
        state_error,
    })
}

async fn collect_final_state(
    states: &ShellStateMap,
    shell: ShellType,
    initial: &ShellState,
    rtn: &TempPath,
    markers: &CaptureMarkers,
) -> Result<ShellStateDiff, ExecError> {
    let output = tokio::fs::read(rtn).await?;
    let final_state = parse_capture(shell, &output, markers).map_err(ExecError::Capture)?;
    let diff = ShellStateDiff::between(initial, &final_state).map_err(ExecError::Capture)?;
    states.insert(shell, final_state).await.map_err(ExecError::Capture)?;
    Ok(diff)
}

fn pump_output(mut reader: Box<dyn std::io::Read + Send>, gate: OutputGate, ck: CommandKey) {
    let mut buf = vec![0u8; OUTPUT_CHUNK_SIZE];
    loop {
        match pty::read_pty(reader.as_mut(), &mut buf) {
            Ok(PtyRead::Data(n)) => {
                let packet = Packet::CmdData(CmdDataPacket {
                    ck,
                    data: Bytes::copy_from_slice(&buf[..n]),
                });
                if !gate.blocking_forward(packet) {
                    break;
                }
            }
            Ok(PtyRead::Closed) => break,
            Err(e) => {
                debug!("Output read for {} failed: {}", ck, e);
                break;
            }
        }
    }
}

fn pump_input(
    mut writer: Box<dyn Write + Send>,
    master: Box<dyn MasterPty + Send>,
    pid: u32,
    initial: Option<Bytes>,
    mut rx: mpsc::UnboundedReceiver<ProcessInput>,
    ck: CommandKey,
) {
    if let Some(data) = initial {
        if let Err(e) = write_input(&mut writer, &data).and_then(|_| write_input(&mut writer, EOF_BYTE)) {
            debug!("Initial input for {} failed: {}", ck, e);
        }
    }

    while let Some(input) = rx.blocking_recv() {
        let result = match input {
            ProcessInput::Data(data) => write_input(&mut writer, &data),
            ProcessInput::Eof => write_input(&mut writer, EOF_BYTE),
            ProcessInput::Resize(size) => master
                .resize(pty::pty_size(size))
                .map_err(|e| std::io::Error::other(e.to_string())),
            ProcessInput::Signal(name) => match pty::signal_number(&name) {
                Some(signal) => {
                    let pgid = master.process_group_leader().unwrap_or(pid as i32);
                    pty::signal_group(pgid, signal)
                }
                None => {
                    warn!("Ignoring unknown signal {:?} for {}", name, ck);
                    Ok(())
                }
            },
        };
        if let Err(e) = result {
            debug!("Input for {} failed: {}", ck, e);
        }
    }
}

fn write_input(writer: &mut Box<dyn Write + Send>, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(data)?;
    writer.flush()
}
