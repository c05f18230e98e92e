//! Packet codec for async streams
//!
//! Each frame is a 4-byte big-endian length followed by a MessagePack body.

use crate::{Packet, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Packet codec for encoding/decoding packets over async streams
pub struct PacketCodec {
    /// Read buffer for incoming data
    read_buf: BytesMut,
    /// Maximum frame size allowed
    max_frame_size: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCodec {
    /// Create a new codec with default settings
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a new codec with custom max frame size
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_frame_size,
        }
    }

    /// Encode a packet to bytes with length prefix
    pub fn encode_packet(&self, packet: &Packet) -> Result<Bytes, ProtocolError> {
        let body = packet.to_msgpack()?;

        if body.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max: self.max_frame_size,
            });
        }

        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);

        Ok(buf.freeze())
    }

    /// Write already-encoded frame bytes
    pub async fn write_encoded<W>(&self, writer: &mut W, encoded: &[u8]) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        writer
            .write_all(encoded)
            .await
            .map_err(|e| ProtocolError::Io(format!("Write error: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| ProtocolError::Io(format!("Flush error: {}", e)))?;
        Ok(())
    }

    /// Write a packet to an async writer
    pub async fn write_packet<W>(&self, writer: &mut W, packet: &Packet) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode_packet(packet)?;
        self.write_encoded(writer, &encoded).await
    }

    /// Read a packet from an async reader.
    ///
    /// Returns `Ok(None)` on a clean EOF between frames. A body that fails to
    /// decode yields [`ProtocolError::Decode`] after its frame has been
    /// consumed, so the caller may keep reading.
    pub async fn read_packet<R>(&mut self, reader: &mut R) -> Result<Option<Packet>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(packet) = self.try_decode_packet()? {
                return Ok(Some(packet));
            }

            let mut temp_buf = [0u8; 8192];
            let n = reader
                .read(&mut temp_buf)
                .await
                .map_err(|e| ProtocolError::Io(format!("Read error: {}", e)))?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                } else {
                    return Err(ProtocolError::TruncatedFrame);
                }
            }

            self.read_buf.extend_from_slice(&temp_buf[..n]);
        }
    }

    /// Try to decode a packet from the internal buffer
    pub fn try_decode_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        if self.read_buf.len() < 4 {
            return Ok(None);
        }

        let frame_len = (&self.read_buf[..4]).get_u32() as usize;

        if frame_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }

        if self.read_buf.len() < 4 + frame_len {
            return Ok(None);
        }

        // Consume the whole frame before decoding so a bad body cannot
        // desynchronize the stream.
        self.read_buf.advance(4);
        let body = self.read_buf.split_to(frame_len);

        Packet::from_msgpack(&body).map(Some)
    }

    /// Get the current buffer size
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }
}
