//! Server loop and packet demux

use crate::builder::{InputOutcome, ReadyRun, RunBuilder, RunOutcome};
use crate::config::ServerConfig;
use crate::error::RegistryError;
use crate::executor::Executor;
use crate::files;
use crate::handlers::{self, HandlerResult};
use crate::process::{ProcessInput, ProcessTable};
use crate::registry::HandlerRegistry;
use crate::sender::{write_loop, PacketSender};
use anyhow::{Context, Result};
use shwire_proto::{
    ErrorCode, ErrorDetails, FileDataPacket, InitPacket, Packet, PacketCodec, PROTOCOL_VERSION,
};
use shwire_state::ShellStateMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A shwire server: owns the live process table, the follow-up handler
/// registry and the shell state cache
pub struct Server {
    config: Arc<ServerConfig>,
    states: Arc<ShellStateMap>,
    processes: Arc<ProcessTable>,
    registry: Arc<HandlerRegistry>,
}

impl Server {
    /// Create a server
    pub fn new(config: ServerConfig) -> Self {
        Self {
            states: Arc::new(ShellStateMap::new(config.state_cache_capacity)),
            processes: Arc::new(ProcessTable::new()),
            registry: Arc::new(HandlerRegistry::new(config.error_cooldown)),
            config: Arc::new(config),
        }
    }

    /// Shell state cache
    pub fn states(&self) -> Arc<ShellStateMap> {
        self.states.clone()
    }

    /// Live process table
    pub fn processes(&self) -> Arc<ProcessTable> {
        self.processes.clone()
    }

    /// Serve one connection until the peer closes it.
    ///
    /// Returns an error when the transport fails in either direction;
    /// undecodable packets are reported to the peer and skipped.
    pub async fn run<R, W>(&self, mut reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        info!("Starting server loop");
        let (sender, rx) = PacketSender::channel(self.config.outbound_queue_depth);
        let mut writer_task = tokio::spawn(write_loop(
            writer,
            rx,
            PacketCodec::with_max_frame_size(self.config.max_frame_size),
        ));

        sender
            .send(Packet::Init(self.init_packet()))
            .await
            .context("Failed to queue init packet")?;

        let background = [
            self.registry.clone().spawn_reaper(self.config.reaper_interval),
            spawn_keepalive(sender.clone(), self.config.keepalive_interval),
        ];
        let executor = Executor::new(
            self.config.clone(),
            sender.clone(),
            self.processes.clone(),
            self.states.clone(),
        );
        let mut builder = RunBuilder::new(self.config.run_input_limit, self.config.pending_run_timeout);
        let mut codec = PacketCodec::with_max_frame_size(self.config.max_frame_size);
        let mut expiry = tokio::time::interval(self.config.reaper_interval);
        expiry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = expiry.tick() => {
                    for run in builder.expire(Instant::now()) {
                        warn!("Run {} never received its input, dropping it", run.ck);
                        let details = ErrorDetails::new(ErrorCode::Timeout, "run input did not reach EOF in time")
                            .with_context("ck", run.ck.to_string());
                        send(&sender, Packet::error_response(run.req_id, details)).await;
                    }
                }
                written = &mut writer_task => {
                    break match written {
                        Ok(Ok(())) => Err(anyhow::anyhow!("Packet writer stopped")),
                        Ok(Err(e)) => Err(e).context("Failed to write packet"),
                        Err(e) => Err(e).context("Packet writer task failed"),
                    };
                }
                read = codec.read_packet(&mut reader) => match read {
                    Ok(Some(packet)) => self.route(packet, &mut builder, &executor, &sender).await,
                    Ok(None) => {
                        info!("Input stream closed, stopping server loop");
                        break Ok(());
                    }
                    Err(e) if !e.is_fatal() => {
                        warn!("Skipping undecodable packet: {}", e);
                        send(&sender, Packet::message(None, format!("dropped packet: {}", e))).await;
                    }
                    Err(e) => break Err(e).context("Failed to read packet"),
                }
            }
        };

        for task in background {
            task.abort();
        }
        drop(executor);
        drop(sender);
        if result.is_ok() {
            // Let the writer flush what is queued. It stops once the last
            // sender clone held by a finishing task is gone.
            match tokio::time::timeout(self.config.shutdown_grace, &mut writer_task).await {
                Ok(Ok(Ok(()))) => debug!("Outbound queue flushed"),
                Ok(Ok(Err(e))) => debug!("Writer failed while flushing: {}", e),
                Ok(Err(e)) => debug!("Writer task failed while flushing: {}", e),
                Err(_) => {
                    warn!(
                        "Outbound queue not flushed within {:?}, dropping the rest",
                        self.config.shutdown_grace
                    );
                    writer_task.abort();
                }
            }
        } else if !writer_task.is_finished() {
            writer_task.abort();
        }
        if let Err(e) = &result {
            error!("Server loop failed: {:#}", e);
        }
        info!("Server loop stopped");
        result
    }

    async fn route(&self, packet: Packet, builder: &mut RunBuilder, executor: &Executor, sender: &PacketSender) {
        debug!("Routing {} packet", packet.kind());
        match packet {
            Packet::Run(run) => match builder.add_run(run, Instant::now()) {
                RunOutcome::Ready(ready) => self.start(ready, executor).await,
                RunOutcome::Held => {}
                RunOutcome::Duplicate(run) => {
                    warn!("Refusing run {}: a run with this key is already waiting", run.ck);
                    let details = ErrorDetails::new(ErrorCode::InvalidRequest, format!("command {} is already waiting for input", run.ck));
                    send(sender, Packet::error_response(run.req_id, details)).await;
                }
            },
            Packet::Input(input) => match builder.add_input(input) {
                InputOutcome::NotPending(input) => {
                    let ck = input.ck;
                    self.processes.deliver(&ck, ProcessInput::from_input(input)).await;
                }
                InputOutcome::Buffered => {}
                InputOutcome::Ready(ready) => self.start(ready, executor).await,
                InputOutcome::Overflow(run) => {
                    warn!("Input for pending run {} exceeded the limit", run.ck);
                    send(
                        sender,
                        Packet::error_response(
                            run.req_id,
                            ErrorDetails::new(ErrorCode::ResourceExhausted, "run input exceeds limit")
                                .with_context("ck", run.ck.to_string()),
                        ),
                    )
                    .await;
                }
            },
            Packet::SpecialInput(special) => {
                let ck = special.ck;
                self.processes.deliver(&ck, ProcessInput::from_special(special)).await;
            }
            Packet::Chdir(p) => {
                let req_id = p.req_id;
                spawn_rpc(sender, req_id, handlers::chdir(p));
            }
            Packet::CompGen(p) => {
                let req_id = p.req_id;
                spawn_rpc(sender, req_id, handlers::compgen(p, self.config.clone()));
            }
            Packet::Reinit(p) => {
                let req_id = p.req_id;
                spawn_rpc(sender, req_id, handlers::reinit(p, self.config.clone(), self.states.clone()));
            }
            Packet::GetState(p) => {
                let req_id = p.req_id;
                spawn_rpc(sender, req_id, handlers::get_state(p, self.states.clone()));
            }
            Packet::StreamFile(p) => {
                tokio::spawn(files::stream_file(p, sender.clone(), self.config.clone()));
            }
            Packet::WriteFile(p) => {
                tokio::spawn(files::start_write_file(
                    p,
                    sender.clone(),
                    self.registry.clone(),
                    self.config.clone(),
                ));
            }
            Packet::FileData(p) => self.follow_up(p, sender).await,
            other => {
                warn!("Unroutable {} packet", other.kind());
                send(
                    sender,
                    Packet::message(other.command_key(), format!("unroutable packet: {}", other.kind())),
                )
                .await;
            }
        }
    }

    async fn start(&self, ready: ReadyRun, executor: &Executor) {
        debug!("Starting run {} ({})", ready.run.ck, ready.run.req_id);
        executor.start(ready).await;
    }

    async fn follow_up(&self, packet: FileDataPacket, sender: &PacketSender) {
        let req_id = packet.req_id;
        match self.registry.dispatch(packet).await {
            Ok(()) => {}
            Err(RegistryError::NoHandler(id)) => {
                if self.registry.should_report(id).await {
                    send(
                        sender,
                        Packet::error_response(
                            id,
                            ErrorDetails::new(ErrorCode::NoHandler, format!("no handler for request {}", id)),
                        ),
                    )
                    .await;
                } else {
                    debug!("Suppressing repeated no-handler error for {}", id);
                }
            }
            Err(RegistryError::Transfer(e)) => {
                // The transfer's own completion packet carries the failure;
                // chunks still in flight for it get no reply.
                warn!("Transfer {} failed: {}", req_id, e);
                self.registry.suppress(req_id).await;
            }
            Err(e) => debug!("Follow-up for {} rejected: {}", req_id, e),
        }
    }

    fn init_packet(&self) -> InitPacket {
        InitPacket {
            protocol_version: PROTOCOL_VERSION,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname(),
            user: username(),
            home_dir: dirs::home_dir()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
            shell_types: self.config.available_shells(),
        }
    }
}

async fn send(sender: &PacketSender, packet: Packet) {
    if let Err(e) = sender.send(packet).await {
        debug!("Dropping outbound packet: {}", e);
    }
}

fn spawn_rpc<F>(sender: &PacketSender, req_id: Uuid, handler: F)
where
    F: Future<Output = HandlerResult> + Send + 'static,
{
    let sender = sender.clone();
    tokio::spawn(async move {
        let response = match handler.await {
            Ok(data) => Packet::response(req_id, data),
            Err(error) => {
                debug!("Request {} failed: {}", req_id, error);
                Packet::error_response(req_id, error)
            }
        };
        send(&sender, response).await;
    });
}

fn spawn_keepalive(sender: PacketSender, interval: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if sender.send(Packet::KeepAlive).await.is_err() {
                break;
            }
        }
    })
}

const HOSTNAME_FILES: [&str; 2] = ["/proc/sys/kernel/hostname", "/etc/hostname"];

fn hostname() -> String {
    if let Some(name) = std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()) {
        return name;
    }
    HOSTNAME_FILES
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .map(|contents| contents.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn username() -> String {
    if let Some(user) = ["USER", "LOGNAME"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|user| !user.is_empty())
    {
        return user;
    }
    if let Some(name) = dirs::home_dir().and_then(|home| home.file_name().map(|name| name.to_string_lossy().into_owned())) {
        return name;
    }
    // /proc/self belongs to the uid the server runs as.
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(metadata) = std::fs::metadata("/proc/self") {
            return metadata.uid().to_string();
        }
    }
    "unknown".to_string()
}
