//! Local server processes
//!
//! Spawns a `shwire-server` binary and exposes its stdio as the client's
//! byte stream. The server's stderr is inherited so its logs stay visible.

use crate::{Result, ShwireError};
use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

/// A server running as a child process
pub struct LocalTransport {
    child: Child,
}

impl LocalTransport {
    /// Spawn `program` with piped stdin and stdout
    pub fn spawn(program: impl AsRef<OsStr>) -> Result<Self> {
        let program = program.as_ref();
        let child = Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ShwireError::Connection(format!("Failed to spawn {:?}: {}", program, e)))?;
        info!("Spawned local server {:?} (pid {:?})", program, child.id());
        Ok(Self { child })
    }

    /// Process id, while the process is running
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Take the server's stdout and stdin; succeeds once
    pub fn take_io(&mut self) -> Result<(ChildStdout, ChildStdin)> {
        let stdout = self.child.stdout.take();
        let stdin = self.child.stdin.take();
        match (stdout, stdin) {
            (Some(stdout), Some(stdin)) => Ok((stdout, stdin)),
            _ => Err(ShwireError::Connection("Server stdio already taken".to_string())),
        }
    }

    /// Wait up to `grace` for the server to exit, then kill it
    pub async fn wait(&mut self, grace: Duration) -> Result<ExitStatus> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!("Local server exited with {}", status);
                Ok(status)
            }
            Err(_) => {
                warn!("Local server did not exit within {:?}, killing it", grace);
                self.child.kill().await?;
                Ok(self.child.wait().await?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program() {
        let result = LocalTransport::spawn("/definitely/not/shwire-server");
        assert!(matches!(result, Err(ShwireError::Connection(_))));
    }

    #[tokio::test]
    async fn test_io_taken_once_and_wait() {
        let mut transport = LocalTransport::spawn("cat").unwrap();
        let (stdout, stdin) = transport.take_io().unwrap();
        assert!(transport.take_io().is_err());

        drop(stdin);
        drop(stdout);
        let status = transport.wait(Duration::from_secs(5)).await.unwrap();
        assert!(status.success());
    }
}
