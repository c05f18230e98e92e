//! Packet types
//!
//! Every frame carries exactly one [`Packet`]. Command packets carry a
//! [`CommandKey`], rpc packets carry a request id and are always answered,
//! and follow-ups attach to an outstanding request id.

use crate::{CommandKey, ProtocolError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use shwire_state::{ShellState, ShellStateDiff, ShellType};
use std::collections::HashMap;
use uuid::Uuid;

/// Protocol version announced in [`InitPacket`]
pub const PROTOCOL_VERSION: u32 = 1;

/// Top-level packet envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    /// Start a command
    Run(RunPacket),
    /// Input bytes for a pending or running command
    Input(InputPacket),
    /// Signal or resize for a running command
    SpecialInput(SpecialInputPacket),
    /// A command started
    CmdStart(CmdStartPacket),
    /// Command output
    CmdData(CmdDataPacket),
    /// A command exited
    CmdDone(CmdDonePacket),
    /// A command failed terminally
    CmdFinal(CmdFinalPacket),

    /// Resolve a directory change
    Chdir(ChdirPacket),
    /// Generate completions
    CompGen(CompGenPacket),
    /// Capture a fresh login shell state
    Reinit(ReinitPacket),
    /// Stream a file to the client
    StreamFile(StreamFilePacket),
    /// Write a file from client data
    WriteFile(WriteFilePacket),
    /// Fetch a cached state
    GetState(GetStatePacket),

    /// File payload chunk for a stream or write transfer
    FileData(FileDataPacket),
    /// Metadata answering a stream-file request
    StreamFileResponse(StreamFileResponsePacket),
    /// The server is ready to receive write-file data
    WriteFileReady(WriteFileReadyPacket),
    /// A write-file transfer finished
    WriteFileDone(WriteFileDonePacket),

    /// First packet sent by the server
    Init(InitPacket),
    /// Periodic liveness signal
    KeepAlive,
    /// Non-fatal diagnostic
    Message(MessagePacket),
    /// Answer to an rpc packet
    Response(ResponsePacket),
}

impl Packet {
    /// Short name of the packet kind, for logs and diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Input(_) => "input",
            Self::SpecialInput(_) => "specialinput",
            Self::CmdStart(_) => "cmdstart",
            Self::CmdData(_) => "cmddata",
            Self::CmdDone(_) => "cmddone",
            Self::CmdFinal(_) => "cmdfinal",
            Self::Chdir(_) => "chdir",
            Self::CompGen(_) => "compgen",
            Self::Reinit(_) => "reinit",
            Self::StreamFile(_) => "streamfile",
            Self::WriteFile(_) => "writefile",
            Self::GetState(_) => "getstate",
            Self::FileData(_) => "filedata",
            Self::StreamFileResponse(_) => "streamfileresponse",
            Self::WriteFileReady(_) => "writefileready",
            Self::WriteFileDone(_) => "writefiledone",
            Self::Init(_) => "init",
            Self::KeepAlive => "keepalive",
            Self::Message(_) => "message",
            Self::Response(_) => "response",
        }
    }

    /// Request id, for rpc packets, follow-ups and their answers
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            Self::Run(p) => Some(p.req_id),
            Self::CmdStart(p) => Some(p.req_id),
            Self::Chdir(p) => Some(p.req_id),
            Self::CompGen(p) => Some(p.req_id),
            Self::Reinit(p) => Some(p.req_id),
            Self::StreamFile(p) => Some(p.req_id),
            Self::WriteFile(p) => Some(p.req_id),
            Self::GetState(p) => Some(p.req_id),
            Self::FileData(p) => Some(p.req_id),
            Self::StreamFileResponse(p) => Some(p.req_id),
            Self::WriteFileReady(p) => Some(p.req_id),
            Self::WriteFileDone(p) => Some(p.req_id),
            Self::Response(p) => Some(p.req_id),
            _ => None,
        }
    }

    /// Command key, for command packets
    pub fn command_key(&self) -> Option<CommandKey> {
        match self {
            Self::Run(p) => Some(p.ck),
            Self::Input(p) => Some(p.ck),
            Self::SpecialInput(p) => Some(p.ck),
            Self::CmdStart(p) => Some(p.ck),
            Self::CmdData(p) => Some(p.ck),
            Self::CmdDone(p) => Some(p.ck),
            Self::CmdFinal(p) => Some(p.ck),
            Self::Message(p) => p.ck,
            _ => None,
        }
    }

    /// Successful response
    pub fn response(req_id: Uuid, data: ResponseData) -> Self {
        Self::Response(ResponsePacket {
            req_id,
            result: Ok(data),
        })
    }

    /// Error response
    pub fn error_response(req_id: Uuid, error: ErrorDetails) -> Self {
        Self::Response(ResponsePacket {
            req_id,
            result: Err(error),
        })
    }

    /// Diagnostic message
    pub fn message(ck: Option<CommandKey>, message: impl Into<String>) -> Self {
        Self::Message(MessagePacket {
            ck,
            message: message.into(),
        })
    }

    /// Serialize to a MessagePack body
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec_named(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from a MessagePack body
    pub fn from_msgpack(data: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(data).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Initiating state of a run: full, by cached hash, or as a diff against a
/// cached base
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateInput {
    /// Complete state
    Full(Box<ShellState>),
    /// Hash of a state the server already caches
    Hash(String),
    /// Diff against a cached base (identified by the diff's base hash)
    Diff(Box<ShellStateDiff>),
}

/// Start a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPacket {
    /// Request id, echoed in [`CmdStartPacket`]
    pub req_id: Uuid,
    /// Command key
    pub ck: CommandKey,
    /// Shell flavor
    pub shell_type: ShellType,
    /// Initiating state
    pub state: StateInput,
    /// Command text
    pub command: String,
    /// Hold the run until the input stream for `ck` reaches EOF
    pub wait_for_input: bool,
}

/// Input bytes for a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPacket {
    /// Command key
    pub ck: CommandKey,
    /// Bytes
    pub data: Bytes,
    /// End of input
    pub eof: bool,
}

/// Terminal size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinSize {
    /// Rows
    pub rows: u16,
    /// Columns
    pub cols: u16,
}

impl Default for WinSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Signal or resize a running command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialInputPacket {
    /// Command key
    pub ck: CommandKey,
    /// Signal name such as `SIGINT`
    pub signal: Option<String>,
    /// New terminal size
    pub win_size: Option<WinSize>,
}

/// A command started
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdStartPacket {
    /// Command key
    pub ck: CommandKey,
    /// Request id of the run
    pub req_id: Uuid,
    /// Process id of the shell
    pub pid: u32,
}

/// Command output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdDataPacket {
    /// Command key
    pub ck: CommandKey,
    /// Output bytes, in pty order
    pub data: Bytes,
}

/// A command exited
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdDonePacket {
    /// Command key
    pub ck: CommandKey,
    /// Exit code of the shell
    pub exit_code: i32,
    /// Wall-clock duration
    pub duration_ms: u64,
    /// Final state as a diff against the initiating state
    pub final_state: Option<ShellStateDiff>,
    /// Why the final state is missing
    pub state_error: Option<String>,
}

/// A command failed before or instead of exiting normally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdFinalPacket {
    /// Command key
    pub ck: CommandKey,
    /// Failure
    pub error: ErrorDetails,
}

/// Resolve a directory change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChdirPacket {
    /// Request id
    pub req_id: Uuid,
    /// Directory the change is relative to
    pub cwd: String,
    /// Target directory
    pub dir: String,
}

/// Completion kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompType {
    /// Files and directories
    File,
    /// Directories only
    Directory,
    /// Commands
    Command,
    /// Variable names
    Variable,
}

impl CompType {
    /// `compgen -A` action name
    pub fn action(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
            Self::Command => "command",
            Self::Variable => "variable",
        }
    }
}

/// Generate completions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompGenPacket {
    /// Request id
    pub req_id: Uuid,
    /// Completion kind
    pub comp_type: CompType,
    /// Prefix to complete
    pub prefix: String,
    /// Directory to complete in
    pub cwd: String,
    /// Shell flavor of the requesting session
    pub shell_type: ShellType,
}

/// Capture a fresh login shell state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReinitPacket {
    /// Request id
    pub req_id: Uuid,
    /// Shell flavor
    pub shell_type: ShellType,
}

/// Stream a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFilePacket {
    /// Request id
    pub req_id: Uuid,
    /// File path
    pub path: String,
    /// Byte range: empty, `[-n]`, `[start]` or inclusive `[start, end]`
    pub byte_range: Vec<i64>,
    /// Only send metadata
    pub stat_only: bool,
}

/// File metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// File name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Unix permission bits
    pub mode: u32,
    /// Modification time, milliseconds since the epoch
    pub mod_ts: i64,
    /// Is a directory
    pub is_dir: bool,
}

/// Answer to a stream-file request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFileResponsePacket {
    /// Request id
    pub req_id: Uuid,
    /// File metadata
    pub info: Option<FileInfo>,
    /// No data chunks follow
    pub done: bool,
    /// Failure
    pub error: Option<ErrorDetails>,
}

/// Write a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteFilePacket {
    /// Request id
    pub req_id: Uuid,
    /// Destination path
    pub path: String,
    /// Write to a temp file and rename on success
    pub use_temp: bool,
}

/// The server accepted a write-file request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteFileReadyPacket {
    /// Request id
    pub req_id: Uuid,
    /// Failure; no data should follow
    pub error: Option<ErrorDetails>,
}

/// A write-file transfer finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteFileDonePacket {
    /// Request id
    pub req_id: Uuid,
    /// Failure
    pub error: Option<ErrorDetails>,
}

/// Fetch a cached state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetStatePacket {
    /// Request id
    pub req_id: Uuid,
    /// Shell flavor
    pub shell_type: ShellType,
    /// Hash; the current state when absent
    pub hash: Option<String>,
}

/// File payload chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDataPacket {
    /// Request id of the transfer
    pub req_id: Uuid,
    /// Bytes
    pub data: Bytes,
    /// Last chunk of the transfer
    pub eof: bool,
    /// Sender-side failure; the transfer is over
    pub error: Option<String>,
}

impl FileDataPacket {
    /// Data chunk
    pub fn chunk(req_id: Uuid, data: Bytes) -> Self {
        Self {
            req_id,
            data,
            eof: false,
            error: None,
        }
    }

    /// Final chunk, optionally carrying an error
    pub fn eof(req_id: Uuid, error: Option<String>) -> Self {
        Self {
            req_id,
            data: Bytes::new(),
            eof: true,
            error,
        }
    }
}

/// Server introduction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitPacket {
    /// Protocol version
    pub protocol_version: u32,
    /// Server version
    pub server_version: String,
    /// Host name
    pub hostname: String,
    /// User name
    pub user: String,
    /// Home directory
    pub home_dir: String,
    /// Shell flavors the server handles
    pub shell_types: Vec<ShellType>,
}

/// Diagnostic message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePacket {
    /// Command the message concerns
    pub ck: Option<CommandKey>,
    /// Text
    pub message: String,
}

/// Successful rpc results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseData {
    /// No payload
    Empty,
    /// Resolved directory
    Cwd(String),
    /// Completions
    Completions {
        /// Matches, sorted
        items: Vec<String>,
        /// More matches exist than were returned
        has_more: bool,
    },
    /// A full state and its hash
    State {
        /// Hash of `state`
        hash: String,
        /// The state
        state: Box<ShellState>,
    },
}

/// Answer to an rpc packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePacket {
    /// Request id
    pub req_id: Uuid,
    /// Outcome
    pub result: Result<ResponseData, ErrorDetails>,
}

/// Error details carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Additional context data
    pub context: HashMap<String, String>,
}

/// Error codes for different types of errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Invalid request format or content
    InvalidRequest,
    /// Path or cached state not found
    NotFound,
    /// Permission denied
    PermissionDenied,
    /// A command could not be started
    StartFailed,
    /// A command task panicked
    Panicked,
    /// Shell state capture failed
    CaptureFailed,
    /// Shell version families differ
    VersionMismatch,
    /// A bounded resource overflowed
    ResourceExhausted,
    /// Timeout occurred
    Timeout,
    /// No handler registered for a follow-up
    NoHandler,
    /// Internal server error
    Internal,
    /// Unsupported operation
    Unsupported,
}

impl ErrorDetails {
    /// Create a new error details
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: HashMap::new(),
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shwire_state::ShellVar;

    fn key() -> CommandKey {
        CommandKey::generate(Uuid::new_v4())
    }

    fn roundtrip(packet: &Packet) -> Packet {
        Packet::from_msgpack(&packet.to_msgpack().unwrap()).unwrap()
    }

    #[test]
    fn test_run_packet_with_full_state() {
        let mut state = ShellState::new("bash v5.2.15(1)-release", "/tmp");
        state.vars.insert("FOO".to_string(), ShellVar::exported("bar"));
        let packet = Packet::Run(RunPacket {
            req_id: Uuid::new_v4(),
            ck: key(),
            shell_type: ShellType::Bash,
            state: StateInput::Full(Box::new(state)),
            command: "echo $FOO".to_string(),
            wait_for_input: false,
        });
        assert_eq!(roundtrip(&packet), packet);
        assert_eq!(packet.kind(), "run");
        assert!(packet.request_id().is_some());
        assert!(packet.command_key().is_some());
    }

    #[test]
    fn test_binary_payloads_survive() {
        let data = Bytes::from(vec![0u8, 255, 10, 13, 0x1e]);
        let packet = Packet::CmdData(CmdDataPacket { ck: key(), data: data.clone() });
        match roundtrip(&packet) {
            Packet::CmdData(p) => assert_eq!(p.data, data),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_responses() {
        let req_id = Uuid::new_v4();
        let ok = Packet::response(
            req_id,
            ResponseData::Completions {
                items: vec!["alpha".to_string()],
                has_more: true,
            },
        );
        assert_eq!(roundtrip(&ok), ok);

        let err = Packet::error_response(
            req_id,
            ErrorDetails::new(ErrorCode::NotFound, "no such state").with_context("hash", "abc"),
        );
        match roundtrip(&err) {
            Packet::Response(ResponsePacket { result: Err(e), .. }) => {
                assert_eq!(e.code, ErrorCode::NotFound);
                assert_eq!(e.context.get("hash"), Some(&"abc".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_control_packets() {
        assert_eq!(roundtrip(&Packet::KeepAlive), Packet::KeepAlive);
        let msg = Packet::message(Some(key()), "marshal failure");
        assert_eq!(roundtrip(&msg), msg);
        assert!(msg.command_key().is_some());
        assert!(Packet::KeepAlive.request_id().is_none());
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let err = Packet::from_msgpack(&[0xc1, 0x00]).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
        assert!(!err.is_fatal());
    }
}
