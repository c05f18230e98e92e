//! Protocol driver
//!
//! One reader task demultiplexes everything the server sends: rpc answers go
//! to the oneshot registered under their request id, file chunks go to the
//! stream waiting for them, and command packets go to the sink of their
//! command. A writer task owns the write half.

use crate::config::ClientConfig;
use crate::sink::{CommandDone, CommandSink};
use crate::transport::LocalTransport;
use crate::{Result, ShwireError};
use bytes::{Bytes, BytesMut};
use shwire_proto::{
    ChdirPacket, CmdDonePacket, CommandKey, CompGenPacket, CompType, ErrorCode, ErrorDetails,
    FileDataPacket, FileInfo, GetStatePacket, InitPacket, InputPacket, Packet, PacketCodec,
    ReinitPacket, ResponseData, RunPacket, SpecialInputPacket, StateInput, StreamFilePacket,
    WinSize, WriteFilePacket, PROTOCOL_VERSION,
};
use shwire_state::{ShellState, ShellStateDiff, ShellStateMap, ShellType};
use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A command to run
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Key the command's packets travel under
    pub ck: CommandKey,
    /// Shell flavor
    pub shell_type: ShellType,
    /// State the command starts from
    pub state: Arc<ShellState>,
    /// Command line, in the shell's syntax
    pub command: String,
    /// Hold the command until its input reaches EOF
    pub wait_for_input: bool,
}

impl RunRequest {
    /// A run with a fresh command key in `group`
    pub fn new(group: Uuid, shell_type: ShellType, state: Arc<ShellState>, command: impl Into<String>) -> Self {
        Self {
            ck: CommandKey::generate(group),
            shell_type,
            state,
            command: command.into(),
            wait_for_input: false,
        }
    }

    /// Buffer input until EOF before starting
    pub fn wait_for_input(mut self) -> Self {
        self.wait_for_input = true;
        self
    }
}

/// Completion candidates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completions {
    /// Sorted candidates
    pub items: Vec<String>,
    /// More candidates exist than were returned
    pub has_more: bool,
}

/// A file being streamed from the server
pub struct FileStream {
    info: FileInfo,
    chunks: Option<mpsc::UnboundedReceiver<FileDataPacket>>,
}

impl FileStream {
    /// Metadata of the file
    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    /// Next chunk of data, or `None` once the stream is complete
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            let Some(chunks) = self.chunks.as_mut() else {
                return Ok(None);
            };
            let Some(packet) = chunks.recv().await else {
                self.chunks = None;
                return Err(ShwireError::Connection("File stream closed before EOF".to_string()));
            };
            if packet.eof {
                self.chunks = None;
                if let Some(error) = packet.error {
                    return Err(ShwireError::Transfer(error));
                }
            }
            if !packet.data.is_empty() {
                return Ok(Some(packet.data));
            }
        }
    }

    /// Read the remaining data into one buffer
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let mut data = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data.freeze())
    }
}

struct CommandEntry {
    req_id: Uuid,
    shell_type: ShellType,
    state_hash: String,
    sink: Arc<dyn CommandSink>,
    fallback: Option<Fallback>,
}

/// The same run carrying its full state, sent once if the server no longer
/// holds the state the first attempt referred to
struct Fallback {
    stale_hash: String,
    run: RunPacket,
}

/// State shared between the client handle and its reader task
struct Shared {
    pending: RwLock<HashMap<Uuid, oneshot::Sender<Packet>>>,
    streams: RwLock<HashMap<Uuid, mpsc::UnboundedSender<FileDataPacket>>>,
    commands: RwLock<HashMap<CommandKey, CommandEntry>>,
    states: Arc<ShellStateMap>,
    /// States the server is known to hold in its cache
    remote: RwLock<HashSet<(ShellType, String)>>,
    /// Does not keep the writer alive once the client is dropped
    outbound: mpsc::WeakUnboundedSender<Packet>,
}

impl Shared {
    async fn route(&self, packet: Packet) {
        match packet {
            Packet::CmdStart(start) => {
                let started = {
                    let commands = self.commands.read().await;
                    commands
                        .get(&start.ck)
                        .map(|entry| (entry.sink.clone(), (entry.shell_type, entry.state_hash.clone())))
                };
                match started {
                    Some((sink, resolved)) => {
                        // The server caches every state it resolves for a run.
                        self.remote.write().await.insert(resolved);
                        sink.on_start(start.ck, start.pid).await
                    }
                    None => debug!("Start for unknown command {}", start.ck),
                }
            }
            Packet::CmdData(data) => {
                let sink = self.sink(&data.ck).await;
                match sink {
                    Some(sink) => sink.on_data(data.ck, data.data).await,
                    None => debug!("Dropping output for unknown command {}", data.ck),
                }
            }
            Packet::CmdDone(done) => self.finish(done).await,
            Packet::CmdFinal(final_packet) => {
                let entry = self.commands.write().await.remove(&final_packet.ck);
                match entry {
                    Some(entry) => entry.sink.on_failed(final_packet.ck, final_packet.error).await,
                    None => debug!("Final packet for unknown command {}", final_packet.ck),
                }
            }
            Packet::FileData(chunk) => self.stream_chunk(chunk).await,
            Packet::Response(_)
            | Packet::StreamFileResponse(_)
            | Packet::WriteFileReady(_)
            | Packet::WriteFileDone(_) => self.answer(packet).await,
            Packet::KeepAlive => debug!("Keepalive from server"),
            Packet::Message(message) => match message.ck {
                Some(ck) => warn!("Server message for {}: {}", ck, message.message),
                None => warn!("Server message: {}", message.message),
            },
            other => warn!("Ignoring unexpected {} packet from server", other.kind()),
        }
    }

    async fn sink(&self, ck: &CommandKey) -> Option<Arc<dyn CommandSink>> {
        self.commands.read().await.get(ck).map(|entry| entry.sink.clone())
    }

    async fn answer(&self, packet: Packet) {
        let Some(req_id) = packet.request_id() else {
            return;
        };
        let waiter = self.pending.write().await.remove(&req_id);
        if let Some(waiter) = waiter {
            if waiter.send(packet).is_err() {
                debug!("Waiter for request {} is gone", req_id);
            }
            return;
        }

        // A run that fails validation is answered on its request id.
        if let Packet::Response(response) = packet {
            if let Err(error) = response.result {
                self.run_rejected(req_id, error).await;
                return;
            }
        }
        warn!("Received answer for unknown request: {}", req_id);
    }

    async fn run_rejected(&self, req_id: Uuid, error: ErrorDetails) {
        let mut commands = self.commands.write().await;
        let Some(ck) = commands
            .iter()
            .find(|(_, entry)| entry.req_id == req_id)
            .map(|(ck, _)| *ck)
        else {
            warn!("Error for unknown request {}: {}", req_id, error.message);
            return;
        };

        if error.code == ErrorCode::NotFound {
            let retry = commands.get_mut(&ck).and_then(|entry| {
                let fallback = entry.fallback.take()?;
                let mut run = fallback.run;
                run.req_id = Uuid::new_v4();
                entry.req_id = run.req_id;
                Some((entry.shell_type, fallback.stale_hash, run))
            });
            if let Some((shell, stale_hash, run)) = retry {
                drop(commands);
                info!("Server no longer holds state {}, resending {} with the full state", stale_hash, ck);
                self.remote.write().await.remove(&(shell, stale_hash));
                if self.send(Packet::Run(run)) {
                    return;
                }
                commands = self.commands.write().await;
            }
        }

        let entry = commands.remove(&ck);
        drop(commands);
        if let Some(entry) = entry {
            entry.sink.on_failed(ck, error).await;
        }
    }

    fn send(&self, packet: Packet) -> bool {
        match self.outbound.upgrade() {
            Some(outbound) => outbound.send(packet).is_ok(),
            None => false,
        }
    }

    async fn stream_chunk(&self, chunk: FileDataPacket) {
        let req_id = chunk.req_id;
        let eof = chunk.eof;
        let delivered = {
            let streams = self.streams.read().await;
            match streams.get(&req_id) {
                Some(tx) => tx.send(chunk).is_ok(),
                None => {
                    debug!("Dropping file data for unknown request {}", req_id);
                    return;
                }
            }
        };
        if eof || !delivered {
            self.streams.write().await.remove(&req_id);
        }
    }

    async fn finish(&self, done: CmdDonePacket) {
        let Some(entry) = self.commands.write().await.remove(&done.ck) else {
            debug!("Done for unknown command {}", done.ck);
            return;
        };

        let mut state_error = done.state_error;
        let mut state_hash = None;
        let mut state = None;
        if let Some(diff) = done.final_state {
            match self.apply_final(entry.shell_type, &diff).await {
                Ok((hash, final_state)) => {
                    state_hash = Some(hash);
                    state = Some(final_state);
                }
                Err(e) => {
                    warn!("Failed to apply final state of {}: {}", done.ck, e);
                    state_error = Some(e.to_string());
                }
            }
        }

        let outcome = CommandDone {
            exit_code: done.exit_code,
            duration: Duration::from_millis(done.duration_ms),
            state_hash,
            state,
            state_error,
        };
        entry.sink.on_done(done.ck, outcome).await;
    }

    async fn apply_final(&self, shell: ShellType, diff: &ShellStateDiff) -> Result<(String, Arc<ShellState>)> {
        let base = self
            .states
            .get(shell, &diff.base_hash)
            .await
            .ok_or_else(|| ShwireError::UnknownState(diff.base_hash.clone()))?;
        let target = diff.apply(&base)?;
        let hash = target.hash()?;
        let target = self.states.insert_hashed(shell, hash.clone(), Arc::new(target)).await;
        self.remote.write().await.insert((shell, hash.clone()));
        Ok((hash, target))
    }

    /// Release every waiter; called once the connection is gone
    async fn fail_all(&self, reason: &str) {
        self.pending.write().await.clear();
        self.streams.write().await.clear();
        let commands: Vec<(CommandKey, CommandEntry)> = self.commands.write().await.drain().collect();
        for (ck, entry) in commands {
            entry
                .sink
                .on_failed(ck, ErrorDetails::new(ErrorCode::Internal, reason))
                .await;
        }
    }
}

/// Client side of one shwire connection
pub struct Client {
    init: InitPacket,
    config: ClientConfig,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Packet>,
    shutdown_tx: mpsc::Sender<()>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    local: Mutex<Option<LocalTransport>>,
}

impl Client {
    /// Perform the handshake over `reader`/`writer` and start the driver tasks
    pub async fn connect<R, W>(mut reader: R, writer: W, config: ClientConfig) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut codec = PacketCodec::with_max_frame_size(config.max_frame_size);
        let init = timeout(config.request_timeout, wait_for_init(&mut codec, &mut reader))
            .await
            .map_err(|_| ShwireError::Timeout {
                duration: config.request_timeout,
            })??;
        if init.protocol_version != PROTOCOL_VERSION {
            return Err(ShwireError::Protocol(format!(
                "Server speaks protocol {}, client speaks {}",
                init.protocol_version, PROTOCOL_VERSION
            )));
        }
        info!(
            "Connected to shwire server {} on {} as {}",
            init.server_version, init.hostname, init.user
        );

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pending: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
            commands: RwLock::new(HashMap::new()),
            states: Arc::new(ShellStateMap::default()),
            remote: RwLock::new(HashSet::new()),
            outbound: outbound.downgrade(),
        });

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let writer = tokio::spawn(write_loop(
            writer,
            outbound_rx,
            shutdown_rx,
            PacketCodec::with_max_frame_size(config.max_frame_size),
        ));
        let reader = tokio::spawn(read_loop(reader, codec, shared.clone()));

        Ok(Self {
            init,
            config,
            shared,
            outbound,
            shutdown_tx,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            local: Mutex::new(None),
        })
    }

    /// Spawn a server binary locally and connect to it over its stdio
    pub async fn spawn_local(program: impl AsRef<OsStr>, config: ClientConfig) -> Result<Self> {
        let mut transport = LocalTransport::spawn(program)?;
        let (stdout, stdin) = transport.take_io()?;
        match Self::connect(stdout, stdin, config.clone()).await {
            Ok(client) => {
                *client.local.lock().await = Some(transport);
                Ok(client)
            }
            Err(e) => {
                if let Err(wait_err) = transport.wait(config.shutdown_grace).await {
                    debug!("Failed to reap local server: {}", wait_err);
                }
                Err(e)
            }
        }
    }

    /// Handshake sent by the server
    pub fn init(&self) -> &InitPacket {
        &self.init
    }

    /// Local shell state cache
    pub fn states(&self) -> Arc<ShellStateMap> {
        self.shared.states.clone()
    }

    /// Start a command. Its events go to `sink`; the returned id is the run's
    /// request id.
    pub async fn run(&self, request: RunRequest, sink: Arc<dyn CommandSink>) -> Result<Uuid> {
        let shell = request.shell_type;
        let hash = request.state.hash()?;
        let state = self.shared.states.insert_hashed(shell, hash.clone(), request.state).await;
        let input = self.state_input(shell, &hash, &state).await;
        let req_id = Uuid::new_v4();
        let run = RunPacket {
            req_id,
            ck: request.ck,
            shell_type: shell,
            state: input,
            command: request.command,
            wait_for_input: request.wait_for_input,
        };
        let stale_hash = match &run.state {
            StateInput::Full(_) => None,
            StateInput::Hash(hash) => Some(hash.clone()),
            StateInput::Diff(diff) => Some(diff.base_hash.clone()),
        };
        let fallback = stale_hash.map(|stale_hash| Fallback {
            stale_hash,
            run: RunPacket {
                state: StateInput::Full(Box::new((*state).clone())),
                ..run.clone()
            },
        });

        {
            let mut commands = self.shared.commands.write().await;
            if commands.contains_key(&request.ck) {
                return Err(ShwireError::Protocol(format!("Command {} is already running", request.ck)));
            }
            commands.insert(
                request.ck,
                CommandEntry {
                    req_id,
                    shell_type: shell,
                    state_hash: hash,
                    sink,
                    fallback,
                },
            );
        }

        let sent = self.send(Packet::Run(run));
        if let Err(e) = sent {
            self.shared.commands.write().await.remove(&request.ck);
            return Err(e);
        }
        debug!("Sent run {} ({})", request.ck, req_id);
        Ok(req_id)
    }

    /// Pick the cheapest way to name `state` to the server
    async fn state_input(&self, shell: ShellType, hash: &str, state: &ShellState) -> StateInput {
        let current = self.shared.states.current(shell).await;
        let remote = self.shared.remote.read().await;
        if remote.contains(&(shell, hash.to_string())) {
            return StateInput::Hash(hash.to_string());
        }
        if let Some((base_hash, base)) = current {
            if remote.contains(&(shell, base_hash)) {
                match ShellStateDiff::between(&base, state) {
                    Ok(diff) => return StateInput::Diff(Box::new(diff)),
                    Err(e) => debug!("Sending full state instead of a diff: {}", e),
                }
            }
        }
        StateInput::Full(Box::new(state.clone()))
    }

    /// Feed input to a command
    pub fn send_input(&self, ck: CommandKey, data: Bytes, eof: bool) -> Result<()> {
        self.send(Packet::Input(InputPacket { ck, data, eof }))
    }

    /// Signal a command's process group by name
    pub fn signal(&self, ck: CommandKey, signal: impl Into<String>) -> Result<()> {
        self.send(Packet::SpecialInput(SpecialInputPacket {
            ck,
            signal: Some(signal.into()),
            win_size: None,
        }))
    }

    /// Resize a command's terminal
    pub fn resize(&self, ck: CommandKey, win_size: WinSize) -> Result<()> {
        self.send(Packet::SpecialInput(SpecialInputPacket {
            ck,
            signal: None,
            win_size: Some(win_size),
        }))
    }

    /// Resolve `dir` against `cwd` on the server
    pub async fn chdir(&self, cwd: impl Into<String>, dir: impl Into<String>) -> Result<String> {
        let req_id = Uuid::new_v4();
        let packet = Packet::Chdir(ChdirPacket {
            req_id,
            cwd: cwd.into(),
            dir: dir.into(),
        });
        match self.rpc(req_id, packet).await? {
            ResponseData::Cwd(dir) => Ok(dir),
            other => Err(unexpected_data(req_id, &other)),
        }
    }

    /// Complete `prefix` in `cwd`
    pub async fn complete(
        &self,
        comp_type: CompType,
        prefix: impl Into<String>,
        cwd: impl Into<String>,
        shell_type: ShellType,
    ) -> Result<Completions> {
        let req_id = Uuid::new_v4();
        let packet = Packet::CompGen(CompGenPacket {
            req_id,
            comp_type,
            prefix: prefix.into(),
            cwd: cwd.into(),
            shell_type,
        });
        match self.rpc(req_id, packet).await? {
            ResponseData::Completions { items, has_more } => Ok(Completions { items, has_more }),
            other => Err(unexpected_data(req_id, &other)),
        }
    }

    /// Recapture the login shell's state and make it current on both sides
    pub async fn reinit(&self, shell_type: ShellType) -> Result<(String, Arc<ShellState>)> {
        let req_id = Uuid::new_v4();
        let data = self.rpc(req_id, Packet::Reinit(ReinitPacket { req_id, shell_type })).await?;
        self.adopt_state(req_id, shell_type, data, true).await
    }

    /// Fetch a state from the server cache; the current one when `hash` is None
    pub async fn get_state(&self, shell_type: ShellType, hash: Option<String>) -> Result<(String, Arc<ShellState>)> {
        let req_id = Uuid::new_v4();
        let want_current = hash.is_none();
        let packet = Packet::GetState(GetStatePacket {
            req_id,
            shell_type,
            hash,
        });
        let data = self.rpc(req_id, packet).await?;
        self.adopt_state(req_id, shell_type, data, want_current).await
    }

    async fn adopt_state(
        &self,
        req_id: Uuid,
        shell: ShellType,
        data: ResponseData,
        make_current: bool,
    ) -> Result<(String, Arc<ShellState>)> {
        let (hash, state) = match data {
            ResponseData::State { hash, state } => (hash, state),
            other => return Err(unexpected_data(req_id, &other)),
        };
        let actual = state.hash()?;
        if actual != hash {
            return Err(ShwireError::Protocol(format!(
                "State hash mismatch: server sent {}, content hashes to {}",
                hash, actual
            )));
        }
        let state = self.shared.states.insert_hashed(shell, hash.clone(), Arc::new(*state)).await;
        if make_current {
            self.shared.states.set_current(shell, &hash).await;
        }
        self.shared.remote.write().await.insert((shell, hash.clone()));
        Ok((hash, state))
    }

    /// Start streaming `path`; `byte_range` follows the server's range rules
    pub async fn stream_file(&self, path: impl Into<String>, byte_range: Vec<i64>) -> Result<FileStream> {
        self.open_stream(path.into(), byte_range, false).await
    }

    /// Metadata of `path`
    pub async fn stat(&self, path: impl Into<String>) -> Result<FileInfo> {
        let stream = self.open_stream(path.into(), Vec::new(), true).await?;
        Ok(stream.info)
    }

    /// Read `path` whole, or the part named by `byte_range`
    pub async fn read_file(&self, path: impl Into<String>, byte_range: Vec<i64>) -> Result<(FileInfo, Bytes)> {
        let mut stream = self.open_stream(path.into(), byte_range, false).await?;
        let data = stream.read_to_end().await?;
        Ok((stream.info, data))
    }

    async fn open_stream(&self, path: String, byte_range: Vec<i64>, stat_only: bool) -> Result<FileStream> {
        let req_id = Uuid::new_v4();
        // Chunks can follow the response immediately, so the stream exists
        // before the request leaves.
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.streams.write().await.insert(req_id, tx);

        let packet = Packet::StreamFile(StreamFilePacket {
            req_id,
            path,
            byte_range,
            stat_only,
        });
        let answer = match self.request(req_id, packet).await {
            Ok(answer) => answer,
            Err(e) => {
                self.shared.streams.write().await.remove(&req_id);
                return Err(e);
            }
        };

        let response = match answer {
            Packet::StreamFileResponse(response) => response,
            other => {
                self.shared.streams.write().await.remove(&req_id);
                return Err(unexpected_answer(req_id, other));
            }
        };
        if response.done || response.error.is_some() {
            self.shared.streams.write().await.remove(&req_id);
        }
        if let Some(error) = response.error {
            return Err(ShwireError::Remote(error));
        }
        let info = response
            .info
            .ok_or_else(|| ShwireError::Protocol(format!("Stream response {} carries no file info", req_id)))?;
        Ok(FileStream {
            info,
            chunks: (!response.done).then_some(rx),
        })
    }

    /// Write `data` to `path` on the server. With `use_temp` the file appears
    /// atomically once every byte has arrived.
    pub async fn write_file(&self, path: impl Into<String>, data: Bytes, use_temp: bool) -> Result<()> {
        let req_id = Uuid::new_v4();
        let ready = self
            .request(
                req_id,
                Packet::WriteFile(WriteFilePacket {
                    req_id,
                    path: path.into(),
                    use_temp,
                }),
            )
            .await?;
        match ready {
            Packet::WriteFileReady(ready) => {
                if let Some(error) = ready.error {
                    return Err(ShwireError::Remote(error));
                }
            }
            other => return Err(unexpected_answer(req_id, other)),
        }

        let mut done_rx = self.register(req_id).await;
        let chunk_size = self.config.write_chunk_size.max(1);
        let mut offset = 0;
        while offset < data.len() {
            // The server answers early only when the transfer has failed.
            if let Ok(answer) = done_rx.try_recv() {
                debug!("Write {} ended after {} of {} bytes", req_id, offset, data.len());
                return write_outcome(req_id, answer);
            }
            let end = (offset + chunk_size).min(data.len());
            self.send(Packet::FileData(FileDataPacket::chunk(req_id, data.slice(offset..end))))?;
            offset = end;
            if offset < data.len() && !self.config.write_chunk_delay.is_zero() {
                tokio::time::sleep(self.config.write_chunk_delay).await;
            }
        }
        self.send(Packet::FileData(FileDataPacket::eof(req_id, None)))?;

        let answer = self.wait(req_id, done_rx).await?;
        write_outcome(req_id, answer)
    }

    /// Close the connection and stop the driver tasks. A spawned local
    /// server is given the configured grace period to exit.
    pub async fn shutdown(&self) -> Result<()> {
        debug!("Shutting down client");
        if self.shutdown_tx.try_send(()).is_err() {
            debug!("Writer already stopped");
        }
        if let Some(writer) = self.writer.lock().await.take() {
            if timeout(self.config.shutdown_grace, writer).await.is_err() {
                warn!("Writer did not stop within {:?}", self.config.shutdown_grace);
            }
        }
        if let Some(mut local) = self.local.lock().await.take() {
            local.wait(self.config.shutdown_grace).await?;
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        self.shared.fail_all("client shut down").await;
        info!("Client shutdown complete");
        Ok(())
    }

    fn send(&self, packet: Packet) -> Result<()> {
        self.outbound
            .send(packet)
            .map_err(|_| ShwireError::Connection("Connection writer has stopped".to_string()))
    }

    async fn register(&self, req_id: Uuid) -> oneshot::Receiver<Packet> {
        let (tx, rx) = oneshot::channel();
        self.shared.pending.write().await.insert(req_id, tx);
        rx
    }

    async fn wait(&self, req_id: Uuid, rx: oneshot::Receiver<Packet>) -> Result<Packet> {
        match timeout(self.config.request_timeout, rx).await {
            Ok(Ok(packet)) => Ok(packet),
            Ok(Err(_)) => Err(ShwireError::Connection(format!(
                "Connection closed while waiting for request {}",
                req_id
            ))),
            Err(_) => {
                self.shared.pending.write().await.remove(&req_id);
                Err(ShwireError::Timeout {
                    duration: self.config.request_timeout,
                })
            }
        }
    }

    async fn request(&self, req_id: Uuid, packet: Packet) -> Result<Packet> {
        let rx = self.register(req_id).await;
        if let Err(e) = self.send(packet) {
            self.shared.pending.write().await.remove(&req_id);
            return Err(e);
        }
        self.wait(req_id, rx).await
    }

    async fn rpc(&self, req_id: Uuid, packet: Packet) -> Result<ResponseData> {
        match self.request(req_id, packet).await? {
            Packet::Response(response) => response.result.map_err(ShwireError::Remote),
            other => Err(unexpected_answer(req_id, other)),
        }
    }
}

fn unexpected_answer(req_id: Uuid, packet: Packet) -> ShwireError {
    if let Packet::Response(response) = &packet {
        if let Err(error) = &response.result {
            return ShwireError::Remote(error.clone());
        }
    }
    ShwireError::Protocol(format!("Unexpected {} answer to request {}", packet.kind(), req_id))
}

fn write_outcome(req_id: Uuid, answer: Packet) -> Result<()> {
    match answer {
        Packet::WriteFileDone(done) => match done.error {
            Some(error) => Err(ShwireError::Remote(error)),
            None => Ok(()),
        },
        Packet::Response(response) => match response.result {
            Err(error) => Err(ShwireError::Remote(error)),
            Ok(data) => Err(unexpected_data(req_id, &data)),
        },
        other => Err(unexpected_answer(req_id, other)),
    }
}

fn unexpected_data(req_id: Uuid, data: &ResponseData) -> ShwireError {
    ShwireError::Protocol(format!("Unexpected response data for request {}: {:?}", req_id, data))
}

async fn wait_for_init<R>(codec: &mut PacketCodec, reader: &mut R) -> Result<InitPacket>
where
    R: AsyncRead + Unpin,
{
    loop {
        match codec.read_packet(reader).await {
            Ok(Some(Packet::Init(init))) => return Ok(init),
            Ok(Some(Packet::KeepAlive)) => {}
            Ok(Some(Packet::Message(message))) => warn!("Server message before init: {}", message.message),
            Ok(Some(other)) => {
                return Err(ShwireError::Protocol(format!(
                    "Expected init packet, got {}",
                    other.kind()
                )))
            }
            Ok(None) => return Err(ShwireError::Connection("Server closed the stream before init".to_string())),
            Err(e) if !e.is_fatal() => warn!("Skipping undecodable packet before init: {}", e),
            Err(e) => return Err(e.into()),
        }
    }
}

async fn read_loop<R>(mut reader: R, mut codec: PacketCodec, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match codec.read_packet(&mut reader).await {
            Ok(Some(packet)) => shared.route(packet).await,
            Ok(None) => {
                info!("Server closed the connection");
                break;
            }
            Err(e) if !e.is_fatal() => warn!("Skipping undecodable packet: {}", e),
            Err(e) => {
                error!("Failed to read packet: {}", e);
                break;
            }
        }
    }
    shared.fail_all("connection closed").await;
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Packet>,
    mut shutdown_rx: mpsc::Receiver<()>,
    codec: PacketCodec,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            packet = rx.recv() => {
                let Some(packet) = packet else {
                    break;
                };
                let encoded = match codec.encode_packet(&packet) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        warn!("Dropping {} packet: {}", packet.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = codec.write_encoded(&mut writer, &encoded).await {
                    error!("Failed to write packet: {}", e);
                    break;
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("Writer received shutdown signal");
                break;
            }
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("Failed to close writer: {}", e);
    }
}

#[cfg(test)]
mod tests;
