//! File streaming and writing
//!
//! Streaming reads answer with metadata first, then paced chunks, and always
//! end with an EOF chunk once data has been promised. Streaming writes queue
//! inbound chunks in a bounded channel drained by a consumer task; a full
//! queue fails the transfer rather than growing.

use crate::config::ServerConfig;
use crate::error::{io_error_code, TransferError};
use crate::registry::{HandlerRegistry, RpcHandler};
use crate::sender::PacketSender;
use async_trait::async_trait;
use bytes::Bytes;
use shwire_proto::{
    ErrorDetails, FileDataPacket, FileInfo, Packet, StreamFilePacket, StreamFileResponsePacket,
    WriteFileDonePacket, WriteFilePacket, WriteFileReadyPacket,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, UNIX_EPOCH};
use tempfile::TempPath;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Resolve a requested byte range against a file size into `[start, end)`.
///
/// `[]` is the whole file, `[n]` with `n < 0` the last `|n|` bytes, `[n]`
/// with `n >= 0` from `n` to the end, and `[a, b]` the inclusive range
/// `a..=b`. Results are clamped to the file; a clamped range may be empty.
pub fn resolve_byte_range(range: &[i64], size: u64) -> Result<(u64, u64), TransferError> {
    let clamp = |v: i64| (v.max(0) as u64).min(size);
    match *range {
        [] => Ok((0, size)),
        [n] if n < 0 => Ok((size.saturating_sub(n.unsigned_abs()), size)),
        [n] => Ok((clamp(n), size)),
        [start, end] => {
            if start < 0 || end < 0 {
                return Err(TransferError::InvalidRange(format!(
                    "negative bound in [{}, {}]",
                    start, end
                )));
            }
            if end < start - 1 {
                return Err(TransferError::InvalidRange(format!("end before start in [{}, {}]", start, end)));
            }
            let start = clamp(start);
            let end = clamp(end.saturating_add(1));
            Ok((start, end.max(start)))
        }
        _ => Err(TransferError::InvalidRange(format!("{} elements", range.len()))),
    }
}

/// Metadata for a path
pub fn file_info(path: &Path, metadata: &std::fs::Metadata) -> FileInfo {
    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode()
    };
    #[cfg(not(unix))]
    let mode = if metadata.permissions().readonly() { 0o444 } else { 0o644 };

    let mod_ts = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    FileInfo {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned()),
        size: metadata.len(),
        mode,
        mod_ts,
        is_dir: metadata.is_dir(),
    }
}

/// Serve a stream-file request
pub async fn stream_file(packet: StreamFilePacket, sender: PacketSender, config: Arc<ServerConfig>) {
    let req_id = packet.req_id;
    let respond = |info: Option<FileInfo>, done: bool, error: Option<ErrorDetails>| {
        let sender = sender.clone();
        async move {
            let response = Packet::StreamFileResponse(StreamFileResponsePacket {
                req_id,
                info,
                done,
                error,
            });
            if let Err(e) = sender.send(response).await {
                debug!("Dropping stream response for {}: {}", req_id, e);
            }
        }
    };

    let path = PathBuf::from(&packet.path);
    let metadata = match tokio::fs::metadata(&path).await {
        Ok(metadata) => metadata,
        Err(e) => {
            let details = ErrorDetails::new(io_error_code(&e), format!("{}: {}", packet.path, e));
            respond(None, true, Some(details)).await;
            return;
        }
    };
    let info = file_info(&path, &metadata);

    if metadata.is_dir() || packet.stat_only {
        respond(Some(info), true, None).await;
        return;
    }

    let (start, end) = match resolve_byte_range(&packet.byte_range, metadata.len()) {
        Ok(range) => range,
        Err(e) => {
            respond(Some(info), true, Some(e.to_details())).await;
            return;
        }
    };
    if start >= end {
        respond(Some(info), true, None).await;
        return;
    }

    respond(Some(info), false, None).await;
    let error = send_range(&path, start, end, &sender, req_id, &config)
        .await
        .err()
        .map(|e| e.to_string());
    if let Some(error) = &error {
        warn!("Streaming {} for {} stopped early: {}", packet.path, req_id, error);
    }
    if let Err(e) = sender.send(Packet::FileData(FileDataPacket::eof(req_id, error))).await {
        debug!("Dropping final chunk for {}: {}", req_id, e);
    }
}

async fn send_range(
    path: &Path,
    start: u64,
    end: u64,
    sender: &PacketSender,
    req_id: Uuid,
    config: &ServerConfig,
) -> Result<(), TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;

    let chunk_size = config.stream_chunk_size.max(1);
    let mut remaining = end - start;
    let mut buf = vec![0u8; chunk_size];
    while remaining > 0 {
        let want = remaining.min(chunk_size as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        remaining -= n as u64;
        sender
            .send(Packet::FileData(FileDataPacket::chunk(req_id, Bytes::copy_from_slice(&buf[..n]))))
            .await
            .map_err(|_| TransferError::Closed)?;
        if remaining > 0 && !config.stream_chunk_delay.is_zero() {
            tokio::time::sleep(config.stream_chunk_delay).await;
        }
    }
    Ok(())
}

/// Receiving side of a write-file transfer
pub struct WriteFileHandler {
    req_id: Uuid,
    chunks: mpsc::Sender<FileDataPacket>,
    depth: usize,
    idle_timeout: Duration,
    deadline: Mutex<Instant>,
    failure: Mutex<Option<TransferError>>,
    abort: Mutex<Option<oneshot::Sender<TransferError>>>,
}

#[async_trait]
impl RpcHandler for WriteFileHandler {
    fn deadline(&self) -> Instant {
        self.deadline.lock().map(|d| *d).unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    async fn dispatch(&self, packet: FileDataPacket) -> Result<(), TransferError> {
        match self.chunks.try_send(packet) {
            Ok(()) => {
                if let Ok(mut deadline) = self.deadline.lock() {
                    *deadline = Instant::now() + self.idle_timeout;
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Write queue for {} overflowed", self.req_id);
                if let Ok(mut failure) = self.failure.lock() {
                    *failure = Some(TransferError::QueueFull { depth: self.depth });
                }
                Err(TransferError::QueueFull { depth: self.depth })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransferError::Closed),
        }
    }

    async fn cleanup(&self) {
        let reason = self
            .failure
            .lock()
            .ok()
            .and_then(|mut f| f.take())
            .unwrap_or(TransferError::Expired);
        let abort = self.abort.lock().ok().and_then(|mut a| a.take());
        if let Some(abort) = abort {
            // The consumer may already be gone after a normal finish.
            let _ = abort.send(reason);
        }
    }
}

struct Destination {
    file: tokio::fs::File,
    temp: Option<TempPath>,
    path: PathBuf,
}

impl Destination {
    async fn open(path: &Path, use_temp: bool) -> Result<Self, TransferError> {
        if !use_temp {
            let file = tokio::fs::File::create(path).await?;
            return Ok(Self {
                file,
                temp: None,
                path: path.to_path_buf(),
            });
        }
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let named = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new().prefix(".shwire-write-").tempfile_in(parent)
        })
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e.to_string())))??;
        let (file, temp) = named.into_parts();
        Ok(Self {
            file: tokio::fs::File::from_std(file),
            temp: Some(temp),
            path: path.to_path_buf(),
        })
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransferError> {
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn finish(mut self) -> Result<(), TransferError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);
        if let Some(temp) = self.temp {
            temp.persist(&self.path).map_err(|e| TransferError::Io(e.error))?;
        }
        Ok(())
    }
}

/// Start a write-file transfer: open the destination, register a handler
/// for the inbound chunks and spawn the consumer that drains them.
pub async fn start_write_file(
    packet: WriteFilePacket,
    sender: PacketSender,
    registry: Arc<HandlerRegistry>,
    config: Arc<ServerConfig>,
) {
    let req_id = packet.req_id;
    let ready = |error: Option<ErrorDetails>| {
        let sender = sender.clone();
        async move {
            if let Err(e) = sender.send(Packet::WriteFileReady(WriteFileReadyPacket { req_id, error })).await {
                debug!("Dropping write-ready for {}: {}", req_id, e);
            }
        }
    };

    let path = PathBuf::from(&packet.path);
    let destination = match Destination::open(&path, packet.use_temp).await {
        Ok(destination) => destination,
        Err(e) => {
            ready(Some(e.to_details().with_context("path", packet.path.clone()))).await;
            return;
        }
    };

    let depth = config.write_queue_depth.max(1);
    let (chunks_tx, chunks_rx) = mpsc::channel(depth);
    let (abort_tx, abort_rx) = oneshot::channel();
    let handler = WriteFileHandler {
        req_id,
        chunks: chunks_tx,
        depth,
        idle_timeout: config.write_idle_timeout,
        deadline: Mutex::new(Instant::now() + config.write_idle_timeout),
        failure: Mutex::new(None),
        abort: Mutex::new(Some(abort_tx)),
    };

    if let Err(e) = registry.register(req_id, Arc::new(handler)).await {
        ready(Some(ErrorDetails::new(shwire_proto::ErrorCode::InvalidRequest, e.to_string()))).await;
        return;
    }
    ready(None).await;
    info!("Receiving {} for request {}", packet.path, req_id);

    tokio::spawn(async move {
        let result = consume_chunks(destination, chunks_rx, abort_rx).await;
        let error = match &result {
            Ok(()) => None,
            Err(e) => {
                warn!("Write of {} for {} failed: {}", packet.path, req_id, e);
                Some(e.to_details().with_context("path", packet.path.clone()))
            }
        };
        registry.unregister(req_id).await;
        if let Err(e) = sender.send(Packet::WriteFileDone(WriteFileDonePacket { req_id, error })).await {
            debug!("Dropping write-done for {}: {}", req_id, e);
        }
    });
}

async fn consume_chunks(
    mut destination: Destination,
    mut chunks: mpsc::Receiver<FileDataPacket>,
    mut abort: oneshot::Receiver<TransferError>,
) -> Result<(), TransferError> {
    loop {
        tokio::select! {
            reason = &mut abort => {
                return Err(reason.unwrap_or(TransferError::Closed));
            }
            chunk = chunks.recv() => {
                let Some(chunk) = chunk else {
                    return Err(TransferError::Closed);
                };
                if let Some(error) = chunk.error {
                    return Err(TransferError::Remote(error));
                }
                if !chunk.data.is_empty() {
                    destination.write(&chunk.data).await?;
                }
                if chunk.eof {
                    return destination.finish().await;
                }
            }
        }
    }
}
