//! Pseudo-terminal helpers built on portable-pty

use crate::error::ExecError;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use shwire_proto::WinSize;
use std::io::{Read, Write};
use std::path::PathBuf;

/// A program to start under a new pty
#[derive(Debug, Clone)]
pub struct PtyCommand {
    /// Program path or name
    pub program: PathBuf,
    /// Arguments
    pub args: Vec<String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Extra environment
    pub env: Vec<(String, String)>,
    /// Initial terminal size
    pub size: WinSize,
}

impl PtyCommand {
    /// Command with no arguments, default size
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            size: WinSize::default(),
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set the working directory when it exists
    pub fn cwd_if_exists(mut self, dir: &str) -> Self {
        let dir = PathBuf::from(dir);
        if dir.is_dir() {
            self.cwd = Some(dir);
        }
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Terminal size
    pub fn size(mut self, size: WinSize) -> Self {
        self.size = size;
        self
    }
}

/// A started pty process
pub struct PtyProcess {
    /// Master side, kept for resizing and process-group lookups
    pub master: Box<dyn MasterPty + Send>,
    /// The child
    pub child: Box<dyn Child + Send + Sync>,
    /// Output of the child
    pub reader: Box<dyn Read + Send>,
    /// Input to the child
    pub writer: Box<dyn Write + Send>,
    /// Process id, 0 when the platform does not report one
    pub pid: u32,
}

/// Convert a wire terminal size
pub fn pty_size(size: WinSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Open a pty and start `command` on its slave side.
///
/// The slave handle is dropped once the child holds it, so reads on the
/// master end when the child and its descendants close the terminal.
pub fn spawn(command: &PtyCommand) -> Result<PtyProcess, ExecError> {
    let pair = native_pty_system()
        .openpty(pty_size(command.size))
        .map_err(|e| ExecError::Start(format!("openpty: {}", e)))?;

    let mut cmd = CommandBuilder::new(&command.program);
    for arg in &command.args {
        cmd.arg(arg);
    }
    if let Some(dir) = &command.cwd {
        cmd.cwd(dir);
    }
    for (key, value) in &command.env {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| ExecError::Start(format!("{}: {}", command.program.display(), e)))?;
    drop(pair.slave);

    let pid = child.process_id().unwrap_or(0);
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| ExecError::Start(format!("pty reader: {}", e)))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| ExecError::Start(format!("pty writer: {}", e)))?;

    Ok(PtyProcess {
        master: pair.master,
        child,
        reader,
        writer,
        pid,
    })
}

/// Outcome of one blocking read from a pty master
#[derive(Debug, PartialEq, Eq)]
pub enum PtyRead {
    /// Bytes were read
    Data(usize),
    /// The terminal is closed
    Closed,
}

/// Read once, folding the ways a pty reports hang-up into [`PtyRead::Closed`]
pub fn read_pty(reader: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<PtyRead> {
    loop {
        match reader.read(buf) {
            Ok(0) => return Ok(PtyRead::Closed),
            Ok(n) => return Ok(PtyRead::Data(n)),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            #[cfg(unix)]
            Err(e) if e.raw_os_error() == Some(libc::EIO) => return Ok(PtyRead::Closed),
            Err(e) => return Err(e),
        }
    }
}

/// Signal number for a name such as `SIGINT`, `int` or `15`
pub fn signal_number(name: &str) -> Option<i32> {
    let name = name.trim();
    if let Ok(num) = name.parse::<i32>() {
        return (num > 0).then_some(num);
    }
    let upper = name.to_ascii_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
    let num = match bare {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "TERM" => libc::SIGTERM,
        "CONT" => libc::SIGCONT,
        "STOP" => libc::SIGSTOP,
        "TSTP" => libc::SIGTSTP,
        "WINCH" => libc::SIGWINCH,
        _ => return None,
    };
    Some(num)
}

/// Send a signal to a process group
pub fn signal_group(pgid: i32, signal: i32) -> std::io::Result<()> {
    if pgid <= 0 {
        return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput));
    }
    // SAFETY: killpg takes plain integers and reports failure through errno.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
