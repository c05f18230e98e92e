//! Outbound packet channel and writer task
//!
//! Every task that produces packets holds a cloned [`PacketSender`]. A single
//! writer task owns the write half of the transport and is the only place
//! frames are encoded. The queue between them is bounded, so a slow
//! transport pushes back on producers instead of growing memory.

use crate::error::ServerError;
use shwire_proto::{Packet, PacketCodec, ProtocolError};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Cloneable handle for queueing outbound packets
#[derive(Debug, Clone)]
pub struct PacketSender {
    tx: mpsc::Sender<Packet>,
}

impl PacketSender {
    /// Create a sender holding at most `depth` queued packets, and the
    /// receiving end for the writer task
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    /// Queue a packet, waiting for room
    pub async fn send(&self, packet: Packet) -> Result<(), ServerError> {
        self.tx.send(packet).await.map_err(|_| ServerError::WriterClosed)
    }

    /// Queue a packet from a blocking thread, waiting for room.
    ///
    /// Must not be called from inside the async runtime.
    pub fn blocking_send(&self, packet: Packet) -> Result<(), ServerError> {
        self.tx.blocking_send(packet).map_err(|_| ServerError::WriterClosed)
    }

    /// Whether the writer has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Drain queued packets into `writer` until every sender is dropped.
///
/// A packet that fails to encode is replaced by a diagnostic message and the
/// loop carries on. A failed write ends the loop with an error.
pub async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Packet>,
    codec: PacketCodec,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(packet) = rx.recv().await {
        let encoded = match codec.encode_packet(&packet) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Failed to encode {} packet: {}", packet.kind(), e);
                let notice = Packet::message(
                    packet.command_key(),
                    format!("failed to encode {} packet: {}", packet.kind(), e),
                );
                codec.encode_packet(&notice)?
            }
        };
        codec.write_encoded(&mut writer, &encoded).await?;
    }
    debug!("All packet senders dropped, writer stopping");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use shwire_proto::{CmdDataPacket, CommandKey};
    use std::io::Cursor;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_writes_in_order() {
        let (sender, rx) = PacketSender::channel(4);
        sender.send(Packet::KeepAlive).await.unwrap();
        sender.send(Packet::message(None, "hello")).await.unwrap();
        drop(sender);

        let mut out = Vec::new();
        write_loop(&mut out, rx, PacketCodec::new()).await.unwrap();

        let mut reader = PacketCodec::new();
        let mut cursor = Cursor::new(out);
        assert_eq!(reader.read_packet(&mut cursor).await.unwrap(), Some(Packet::KeepAlive));
        assert_eq!(
            reader.read_packet(&mut cursor).await.unwrap(),
            Some(Packet::message(None, "hello"))
        );
    }

    #[tokio::test]
    async fn test_oversized_packet_becomes_message() {
        let ck = CommandKey::generate(Uuid::new_v4());
        let (sender, rx) = PacketSender::channel(4);
        sender
            .send(Packet::CmdData(CmdDataPacket {
                ck,
                data: Bytes::from(vec![0u8; 4096]),
            }))
            .await
            .unwrap();
        drop(sender);

        let mut out = Vec::new();
        write_loop(&mut out, rx, PacketCodec::with_max_frame_size(1024)).await.unwrap();

        let mut reader = PacketCodec::new();
        let packet = reader.read_packet(&mut Cursor::new(out)).await.unwrap();
        match packet {
            Some(Packet::Message(message)) => {
                assert_eq!(message.ck, Some(ck));
                assert!(message.message.contains("cmddata"));
            }
            other => panic!("Expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_after_writer_gone() {
        let (sender, rx) = PacketSender::channel(4);
        drop(rx);
        assert!(sender.is_closed());
        assert!(matches!(sender.send(Packet::KeepAlive).await, Err(ServerError::WriterClosed)));
    }

    #[tokio::test]
    async fn test_full_queue_holds_back_producers() {
        let (sender, mut rx) = PacketSender::channel(1);
        sender.send(Packet::KeepAlive).await.unwrap();

        let blocked = tokio::task::spawn_blocking({
            let sender = sender.clone();
            move || sender.blocking_send(Packet::message(None, "second"))
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        assert_eq!(rx.recv().await, Some(Packet::KeepAlive));
        blocked.await.unwrap().unwrap();
        assert_eq!(rx.recv().await, Some(Packet::message(None, "second")));
    }
}
