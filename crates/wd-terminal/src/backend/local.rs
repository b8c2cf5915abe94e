//! Local PTY backend
//!
//! Runs a native shell on a pseudo-terminal using portable-pty. Reading from
//! the PTY is blocking, so the reader and the exit wait share one blocking
//! task; that keeps the exit event strictly after the last data chunk.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use wd_core::{InstanceId, TerminalError, TerminalSize};

use super::{BackendEvent, BackendSpawner, SpawnConfig, TerminalBackend};

/// Shells accepted without consulting /etc/shells
const ALLOWED_SHELLS: &[&str] = &[
    "/bin/sh",
    "/bin/bash",
    "/bin/zsh",
    "/bin/fish",
    "/bin/dash",
    "/usr/bin/sh",
    "/usr/bin/bash",
    "/usr/bin/zsh",
    "/usr/bin/fish",
    "/usr/local/bin/bash",
    "/usr/local/bin/zsh",
    "/usr/local/bin/fish",
    "/opt/homebrew/bin/bash",
    "/opt/homebrew/bin/zsh",
    "/opt/homebrew/bin/fish",
];

const READ_BUFFER: usize = 4096;

/// Validate that a shell path is allowed and exists
fn validate_shell_path(shell: &str) -> Result<String, String> {
    let listed = ALLOWED_SHELLS.contains(&shell)
        || std::fs::read_to_string("/etc/shells")
            .map(|shells| {
                shells
                    .lines()
                    .map(str::trim)
                    .any(|line| !line.starts_with('#') && line == shell)
            })
            .unwrap_or(false);

    if !listed {
        return Err(format!("shell '{}' is not an allowed login shell", shell));
    }
    if !Path::new(shell).exists() {
        return Err(format!("shell '{}' does not exist", shell));
    }
    Ok(shell.to_string())
}

/// Spawns local shells on a PTY
#[derive(Debug, Clone, Default)]
pub struct LocalSpawner {
    shell: Option<String>,
    env: Vec<(String, String)>,
}

impl LocalSpawner {
    pub fn new(shell: Option<String>, env: Vec<(String, String)>) -> Self {
        Self { shell, env }
    }

    fn resolve_shell(&self) -> String {
        self.shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

#[async_trait]
impl BackendSpawner for LocalSpawner {
    async fn spawn(
        &self,
        id: &InstanceId,
        config: &SpawnConfig,
        size: TerminalSize,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<Box<dyn TerminalBackend>, TerminalError> {
        let SpawnConfig::Local { working_dir } = config else {
            return Err(TerminalError::spawn_failed(id, "not a local session config"));
        };

        if !working_dir.is_dir() {
            return Err(TerminalError::spawn_failed(
                id,
                format!("working directory {} does not exist", working_dir.display()),
            ));
        }

        let shell = validate_shell_path(&self.resolve_shell())
            .map_err(|reason| TerminalError::spawn_failed(id, reason))?;

        tracing::info!(
            "Spawning local shell {} for {} in {} ({}x{})",
            shell,
            id,
            working_dir.display(),
            size.cols,
            size.rows
        );

        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| TerminalError::spawn_failed(id, format!("failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(&shell);
        cmd.cwd(working_dir);
        cmd.env("TERM", "xterm-256color");
        cmd.env("WARDEN_INSTANCE_ID", id.as_str());
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TerminalError::spawn_failed(id, format!("failed to spawn shell: {}", e)))?;
        // The child holds its own handle; keeping ours would stop EOF on exit.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let setup = pair
            .master
            .try_clone_reader()
            .and_then(|reader| pair.master.take_writer().map(|writer| (reader, writer)));
        let (mut reader, writer) = match setup {
            Ok(handles) => handles,
            Err(e) => {
                let _ = child.kill();
                return Err(TerminalError::spawn_failed(
                    id,
                    format!("failed to attach PTY: {}", e),
                ));
            }
        };

        tracing::debug!("Local shell for {} has pid {:?}", id, pid);

        let instance = id.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUFFER];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        tracing::trace!("{} read {} bytes", instance, n);
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        if events.blocking_send(BackendEvent::Data(chunk)).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO is the normal end-of-stream on Linux once the shell exits
                        tracing::debug!("PTY read for {} ended: {}", instance, e);
                        break;
                    }
                }
            }

            let code = match child.wait() {
                Ok(status) => Some(status.exit_code() as i32),
                Err(e) => {
                    tracing::warn!("Failed to reap shell for {}: {}", instance, e);
                    None
                }
            };
            tracing::info!("Local shell for {} exited with {:?}", instance, code);
            let _ = events.blocking_send(BackendEvent::Exit(code));
        });

        Ok(Box::new(LocalBackend {
            pid,
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
        }))
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A shell running on a local PTY
struct LocalBackend {
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

#[async_trait]
impl TerminalBackend for LocalBackend {
    async fn write(&self, data: &[u8]) -> Result<(), TerminalError> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    async fn resize(&self, size: TerminalSize) -> Result<(), TerminalError> {
        let master = self.master.lock().unwrap_or_else(|e| e.into_inner());
        master
            .resize(pty_size(size))
            .map_err(|e| TerminalError::Io(std::io::Error::other(e.to_string())))
    }

    async fn kill(&self) -> Result<(), TerminalError> {
        let mut killer = self.killer.lock().unwrap_or_else(|e| e.into_inner());
        match killer.kill() {
            Ok(()) => Ok(()),
            // Already gone
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn cwd(&self) -> Option<PathBuf> {
        process_cwd(self.pid?).await
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[cfg(target_os = "linux")]
async fn process_cwd(pid: u32) -> Option<PathBuf> {
    tokio::fs::read_link(format!("/proc/{}/cwd", pid)).await.ok()
}

#[cfg(not(target_os = "linux"))]
async fn process_cwd(pid: u32) -> Option<PathBuf> {
    let output = tokio::process::Command::new("lsof")
        .args(["-a", "-p", &pid.to_string(), "-d", "cwd", "-Fn"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|line| line.strip_prefix('n'))
        .map(PathBuf::from)
}
