//! One-shot rpc handlers
//!
//! Each handler answers a single request with a [`ResponseData`] or the
//! [`ErrorDetails`] to send back.

use crate::config::ServerConfig;
use crate::error::{io_error_code, ExecError};
use crate::pty::{self, PtyCommand, PtyRead};
use portable_pty::ChildKiller;
use shwire_proto::{
    ChdirPacket, CompGenPacket, CompType, ErrorCode, ErrorDetails, GetStatePacket, ReinitPacket,
    ResponseData,
};
use shwire_state::capture::{capture_script, parse_capture};
use shwire_state::{CaptureMarkers, ShellStateMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

/// Result of a one-shot handler
pub type HandlerResult = Result<ResponseData, ErrorDetails>;

/// Resolve a directory change relative to `cwd`
pub async fn chdir(packet: ChdirPacket) -> HandlerResult {
    let target = resolve_dir(&packet.cwd, &packet.dir, dirs::home_dir().as_deref());
    let resolved = tokio::fs::canonicalize(&target).await.map_err(|e| {
        ErrorDetails::new(io_error_code(&e), format!("cd {}: {}", packet.dir, e))
            .with_context("cwd", packet.cwd.clone())
    })?;
    let metadata = tokio::fs::metadata(&resolved)
        .await
        .map_err(|e| ErrorDetails::new(io_error_code(&e), format!("cd {}: {}", packet.dir, e)))?;
    if !metadata.is_dir() {
        return Err(ErrorDetails::new(
            ErrorCode::InvalidRequest,
            format!("cd {}: not a directory", packet.dir),
        ));
    }
    Ok(ResponseData::Cwd(resolved.to_string_lossy().into_owned()))
}

fn resolve_dir(cwd: &str, dir: &str, home: Option<&Path>) -> PathBuf {
    if dir.is_empty() || dir == "~" {
        return home.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(cwd));
    }
    if let (Some(rest), Some(home)) = (dir.strip_prefix("~/"), home) {
        return home.join(rest);
    }
    let dir = Path::new(dir);
    if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        Path::new(cwd).join(dir)
    }
}

/// Generate completions with bash's `compgen`
pub async fn compgen(packet: CompGenPacket, config: Arc<ServerConfig>) -> HandlerResult {
    let mut command = Command::new(config.shell_path(shwire_state::ShellType::Bash));
    command
        .args(["--noprofile", "--norc", "-c", r#"compgen -A "$1" -- "$2""#, "shwire-compgen"])
        .arg(packet.comp_type.action())
        .arg(&packet.prefix)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let cwd = Path::new(&packet.cwd);
    if cwd.is_dir() {
        command.current_dir(cwd);
    }

    let output = tokio::time::timeout(config.capture_timeout, command.output())
        .await
        .map_err(|_| ErrorDetails::new(ErrorCode::Timeout, "completion timed out"))?
        .map_err(|e| ErrorDetails::new(ErrorCode::StartFailed, format!("compgen: {}", e)))?;

    let mut items: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| decorate(packet.comp_type, cwd, line))
        .collect();
    items.sort();
    items.dedup();

    let has_more = items.len() > config.completion_limit;
    items.truncate(config.completion_limit);
    debug!("{} completions for {:?}", items.len(), packet.prefix);
    Ok(ResponseData::Completions { items, has_more })
}

fn decorate(comp_type: CompType, cwd: &Path, item: &str) -> String {
    let is_dir = match comp_type {
        CompType::Directory => true,
        CompType::File => cwd.join(item).is_dir(),
        CompType::Command | CompType::Variable => false,
    };
    if is_dir && !item.ends_with('/') {
        format!("{}/", item)
    } else {
        item.to_string()
    }
}

/// Capture a fresh login shell and make it the current state for its flavor
pub async fn reinit(packet: ReinitPacket, config: Arc<ServerConfig>, states: Arc<ShellStateMap>) -> HandlerResult {
    let shell = packet.shell_type;
    let markers = CaptureMarkers::generate();
    let command = PtyCommand::new(config.shell_path(shell))
        .arg("-l")
        .arg("-i")
        .arg("-c")
        .arg(capture_script(shell, &markers))
        .cwd_if_exists(&dirs::home_dir().map(|h| h.to_string_lossy().into_owned()).unwrap_or_default())
        .size(config.win_size);

    let output = capture_login_shell(command, &markers, config.capture_timeout)
        .await
        .map_err(|e| e.to_details())?;
    let state = parse_capture(shell, &output, &markers)
        .map_err(|e| ExecError::Capture(e).to_details())?;
    let (hash, state) = states
        .insert(shell, state)
        .await
        .map_err(|e| ExecError::Capture(e).to_details())?;
    states.set_current(shell, &hash).await;
    info!("Reinitialized {} state {}", shell, hash);

    Ok(ResponseData::State {
        hash,
        state: Box::new((*state).clone()),
    })
}

async fn capture_login_shell(
    command: PtyCommand,
    markers: &CaptureMarkers,
    limit: std::time::Duration,
) -> Result<Vec<u8>, ExecError> {
    let process = tokio::task::spawn_blocking(move || pty::spawn(&command))
        .await
        .map_err(|e| ExecError::Start(e.to_string()))??;
    let mut killer = process.child.clone_killer();
    let end = markers.end();

    let mut reader = process.reader;
    let read = tokio::task::spawn_blocking(move || {
        let mut output = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match pty::read_pty(reader.as_mut(), &mut buf) {
                Ok(PtyRead::Data(n)) => {
                    let scan_from = output.len().saturating_sub(end.len());
                    output.extend_from_slice(&buf[..n]);
                    if contains(&output[scan_from..], &end) {
                        break;
                    }
                }
                Ok(PtyRead::Closed) => break,
                Err(e) => {
                    debug!("Capture read failed: {}", e);
                    break;
                }
            }
        }
        output
    });

    match tokio::time::timeout(limit, read).await {
        Ok(output) => {
            let output = output.map_err(|e| ExecError::Io(std::io::Error::other(e.to_string())))?;
            let mut child = process.child;
            tokio::task::spawn_blocking(move || {
                if let Ok(None) = child.try_wait() {
                    let _ = child.kill();
                }
                let _ = child.wait();
            });
            Ok(output)
        }
        Err(_) => {
            let _ = killer.kill();
            Err(ExecError::Timeout(limit))
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Look up a cached state, or the current one when no hash is given
pub async fn get_state(packet: GetStatePacket, states: Arc<ShellStateMap>) -> HandlerResult {
    let found = match &packet.hash {
        Some(hash) => states.get(packet.shell_type, hash).await.map(|s| (hash.clone(), s)),
        None => states.current(packet.shell_type).await,
    };
    let (hash, state) = found.ok_or_else(|| {
        let what = packet.hash.clone().unwrap_or_else(|| "current".to_string());
        ErrorDetails::new(
            ErrorCode::NotFound,
            format!("no cached {} state {}", packet.shell_type, what),
        )
    })?;
    Ok(ResponseData::State {
        hash,
        state: Box::new((*state).clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shwire_state::{ShellState, ShellType};
    use tempfile::TempDir;
    use uuid::Uuid;

    #[test]
    fn test_resolve_dir() {
        let home = Path::new("/home/me");
        assert_eq!(resolve_dir("/tmp", "sub", Some(home)), PathBuf::from("/tmp/sub"));
        assert_eq!(resolve_dir("/tmp", "/etc", Some(home)), PathBuf::from("/etc"));
        assert_eq!(resolve_dir("/tmp", "~", Some(home)), PathBuf::from("/home/me"));
        assert_eq!(resolve_dir("/tmp", "~/src", Some(home)), PathBuf::from("/home/me/src"));
        assert_eq!(resolve_dir("/tmp", "", None), PathBuf::from("/tmp"));
    }

    #[tokio::test]
    async fn test_chdir_resolves_relative() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("inner")).unwrap();
        let result = chdir(ChdirPacket {
            req_id: Uuid::new_v4(),
            cwd: dir.path().to_string_lossy().into_owned(),
            dir: "inner/../inner".to_string(),
        })
        .await
        .unwrap();
        let expected = std::fs::canonicalize(dir.path().join("inner")).unwrap();
        assert_eq!(result, ResponseData::Cwd(expected.to_string_lossy().into_owned()));
    }

    #[tokio::test]
    async fn test_chdir_errors() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("file"), b"x").unwrap();
        let cwd = dir.path().to_string_lossy().into_owned();

        let missing = chdir(ChdirPacket {
            req_id: Uuid::new_v4(),
            cwd: cwd.clone(),
            dir: "nope".to_string(),
        })
        .await
        .unwrap_err();
        assert_eq!(missing.code, ErrorCode::NotFound);

        let not_dir = chdir(ChdirPacket {
            req_id: Uuid::new_v4(),
            cwd,
            dir: "file".to_string(),
        })
        .await
        .unwrap_err();
        assert_eq!(not_dir.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_compgen_files() {
        let config = Arc::new(ServerConfig {
            completion_limit: 2,
            ..ServerConfig::default()
        });
        if crate::config::resolve_program(config.shell_path(ShellType::Bash)).is_none() {
            return;
        }
        let dir = TempDir::new().unwrap();
        for name in ["alpha.txt", "alps.txt", "beta.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("alcove")).unwrap();

        let result = compgen(
            CompGenPacket {
                req_id: Uuid::new_v4(),
                comp_type: CompType::File,
                prefix: "al".to_string(),
                cwd: dir.path().to_string_lossy().into_owned(),
                shell_type: ShellType::Bash,
            },
            config,
        )
        .await
        .unwrap();
        assert_eq!(
            result,
            ResponseData::Completions {
                items: vec!["alcove/".to_string(), "alpha.txt".to_string()],
                has_more: true,
            }
        );
    }

    #[tokio::test]
    async fn test_compgen_missing_shell() {
        let mut config = ServerConfig::default();
        config.shells.bash = "/definitely/not/bash".into();
        let err = compgen(
            CompGenPacket {
                req_id: Uuid::new_v4(),
                comp_type: CompType::Command,
                prefix: "ls".to_string(),
                cwd: "/".to_string(),
                shell_type: ShellType::Bash,
            },
            Arc::new(config),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::StartFailed);
    }

    #[tokio::test]
    async fn test_get_state() {
        let states = Arc::new(ShellStateMap::default());
        let request = |hash: Option<String>| GetStatePacket {
            req_id: Uuid::new_v4(),
            shell_type: ShellType::Bash,
            hash,
        };

        let err = get_state(request(None), states.clone()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);

        let state = ShellState::new("bash v5.2.15(1)-release", "/srv");
        let (hash, _) = states.insert(ShellType::Bash, state.clone()).await.unwrap();
        let found = get_state(request(Some(hash.clone())), states.clone()).await.unwrap();
        assert_eq!(
            found,
            ResponseData::State {
                hash: hash.clone(),
                state: Box::new(state.clone()),
            }
        );

        assert!(get_state(request(None), states.clone()).await.is_err());
        states.set_current(ShellType::Bash, &hash).await;
        assert!(get_state(request(None), states).await.is_ok());
    }

    #[tokio::test]
    async fn test_reinit_bash() {
        let config = Arc::new(ServerConfig::default());
        if crate::config::resolve_program(config.shell_path(ShellType::Bash)).is_none() {
            return;
        }
        let states = Arc::new(ShellStateMap::default());
        let result = reinit(
            ReinitPacket {
                req_id: Uuid::new_v4(),
                shell_type: ShellType::Bash,
            },
            config,
            states.clone(),
        )
        .await;
        match result {
            Ok(ResponseData::State { hash, state }) => {
                assert!(state.version.starts_with("bash v"));
                assert!(!state.cwd.is_empty());
                assert_eq!(states.current(ShellType::Bash).await.unwrap().0, hash);
            }
            // No pty support in this environment
            Err(e) if e.code == ErrorCode::StartFailed => {}
            other => panic!("Unexpected reinit result: {:?}", other),
        }
    }
}
