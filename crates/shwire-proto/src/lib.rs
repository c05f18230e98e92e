//! # Shwire Protocol
//!
//! Packet definitions, command keys and the length-prefixed MessagePack
//! codec spoken between a shwire client and server.

#![warn(missing_docs)]

/// Command keys
pub mod key;

/// Packet types
pub mod packet;

/// Packet codec for async streams
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use key::CommandKey;
pub use packet::{
    ChdirPacket, CmdDataPacket, CmdDonePacket, CmdFinalPacket, CmdStartPacket, CompGenPacket,
    CompType, ErrorCode, ErrorDetails, FileDataPacket, FileInfo, GetStatePacket, InitPacket,
    InputPacket, MessagePacket, Packet, ReinitPacket, ResponseData, ResponsePacket, RunPacket,
    SpecialInputPacket, StateInput, StreamFilePacket, StreamFileResponsePacket, WinSize,
    WriteFileDonePacket, WriteFilePacket, WriteFileReadyPacket, PROTOCOL_VERSION,
};
pub use codec::{PacketCodec, MAX_FRAME_SIZE};
pub use error::ProtocolError;
