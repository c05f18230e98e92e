//! Server configuration

use shwire_proto::{WinSize, MAX_FRAME_SIZE};
use shwire_state::ShellType;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Shell binaries used for commands, completion and reinit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellPaths {
    /// bash binary
    pub bash: PathBuf,
    /// zsh binary
    pub zsh: PathBuf,
}

impl Default for ShellPaths {
    fn default() -> Self {
        Self {
            bash: PathBuf::from("bash"),
            zsh: PathBuf::from("zsh"),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How often the reaper looks for expired follow-up handlers
    pub reaper_interval: Duration,
    /// Minimum gap between two "no handler" errors for one request id
    pub error_cooldown: Duration,
    /// Period of keepalive packets
    pub keepalive_interval: Duration,
    /// A write transfer that receives nothing for this long is dropped
    pub write_idle_timeout: Duration,
    /// Queued inbound chunks per write transfer before it fails
    pub write_queue_depth: usize,
    /// Bytes per outbound file chunk
    pub stream_chunk_size: usize,
    /// Pause between outbound file chunks
    pub stream_chunk_delay: Duration,
    /// Maximum completions per response
    pub completion_limit: usize,
    /// Largest accepted frame
    pub max_frame_size: usize,
    /// How long to keep draining pty output after a command exits
    pub exit_drain_grace: Duration,
    /// Time limit for login-shell captures and completion
    pub capture_timeout: Duration,
    /// Buffered input allowed for a run waiting on its input
    pub run_input_limit: usize,
    /// A run still waiting on its input after this long is dropped
    pub pending_run_timeout: Duration,
    /// Outbound packets queued for the writer before producers wait
    pub outbound_queue_depth: usize,
    /// How long queued packets may take to flush after the peer hangs up
    pub shutdown_grace: Duration,
    /// Number of cached shell states
    pub state_cache_capacity: usize,
    /// Terminal size for new commands
    pub win_size: WinSize,
    /// Shell binaries
    pub shells: ShellPaths,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            reaper_interval: Duration::from_secs(1),
            error_cooldown: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(60),
            write_idle_timeout: Duration::from_secs(30),
            write_queue_depth: 64,
            stream_chunk_size: 32 * 1024,
            stream_chunk_delay: Duration::from_millis(10),
            completion_limit: 50,
            max_frame_size: MAX_FRAME_SIZE,
            exit_drain_grace: Duration::from_millis(250),
            capture_timeout: Duration::from_secs(10),
            run_input_limit: 1024 * 1024,
            pending_run_timeout: Duration::from_secs(60),
            outbound_queue_depth: 256,
            shutdown_grace: Duration::from_secs(2),
            state_cache_capacity: shwire_state::cache::DEFAULT_CAPACITY,
            win_size: WinSize::default(),
            shells: ShellPaths::default(),
        }
    }
}

impl ServerConfig {
    /// Default configuration with `SHWIRE_*` environment overrides applied
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from a variable lookup
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bash) = lookup("SHWIRE_BASH").filter(|v| !v.is_empty()) {
            self.shells.bash = PathBuf::from(bash);
        }
        if let Some(zsh) = lookup("SHWIRE_ZSH").filter(|v| !v.is_empty()) {
            self.shells.zsh = PathBuf::from(zsh);
        }
        if let Some(secs) = lookup("SHWIRE_KEEPALIVE_SECS") {
            match secs.parse::<u64>() {
                Ok(secs) if secs > 0 => self.keepalive_interval = Duration::from_secs(secs),
                _ => warn!("Ignoring invalid SHWIRE_KEEPALIVE_SECS value {:?}", secs),
            }
        }
        self
    }

    /// Binary for a shell flavor
    pub fn shell_path(&self, shell: ShellType) -> &Path {
        match shell {
            ShellType::Bash => &self.shells.bash,
            ShellType::Zsh => &self.shells.zsh,
        }
    }

    /// Shell flavors whose binary can be found
    pub fn available_shells(&self) -> Vec<ShellType> {
        ShellType::ALL
            .into_iter()
            .filter(|shell| resolve_program(self.shell_path(*shell)).is_some())
            .collect()
    }
}

/// Resolve a program name against `PATH`; paths with a separator are checked
/// as they are.
pub fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return program.is_file().then(|| program.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.stream_chunk_size, 32 * 1024);
        assert_eq!(config.stream_chunk_delay, Duration::from_millis(10));
        assert_eq!(config.write_idle_timeout, Duration::from_secs(30));
        assert_eq!(config.max_frame_size, MAX_FRAME_SIZE);
        assert_eq!(config.shell_path(ShellType::Bash), Path::new("bash"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SHWIRE_BASH", "/opt/bash/bin/bash"),
            ("SHWIRE_ZSH", ""),
            ("SHWIRE_KEEPALIVE_SECS", "15"),
        ]
        .into_iter()
        .collect();
        let config = ServerConfig::default().with_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.shells.bash, PathBuf::from("/opt/bash/bin/bash"));
        assert_eq!(config.shells.zsh, PathBuf::from("zsh"));
        assert_eq!(config.keepalive_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_invalid_keepalive_is_ignored() {
        let config = ServerConfig::default().with_overrides(|name| {
            (name == "SHWIRE_KEEPALIVE_SECS").then(|| "soon".to_string())
        });
        assert_eq!(config.keepalive_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_resolve_program() {
        assert!(resolve_program(Path::new("/definitely/not/here")).is_none());
        assert!(resolve_program(Path::new("shwire-no-such-binary")).is_none());
        #[cfg(unix)]
        if Path::new("/bin/sh").is_file() {
            assert_eq!(resolve_program(Path::new("/bin/sh")), Some(PathBuf::from("/bin/sh")));
        }
    }
}
