//! Remote shell backend
//!
//! Opens an SSH connection per session and runs a login shell on a PTY
//! channel. One task owns the channel and serialises output, writes and
//! resizes through it. The shell records its pid in a per-instance file so
//! the working directory can be probed later over a separate exec channel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc;

use wd_core::{InstanceId, TerminalError, TerminalSize};
use wd_ssh::{ConnectionProvider, SshConnector, SshSession};

use super::{shell_quote, BackendEvent, BackendSpawner, SpawnConfig, TerminalBackend};

/// Default deadline for the remote working-directory probe
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Spawns shells on remote machines
pub struct SshSpawner {
    provider: Arc<dyn ConnectionProvider>,
    connector: SshConnector,
    probe_timeout: Duration,
}

impl SshSpawner {
    pub fn new(provider: Arc<dyn ConnectionProvider>, connector: SshConnector) -> Self {
        Self {
            provider,
            connector,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

#[async_trait]
impl BackendSpawner for SshSpawner {
    async fn spawn(
        &self,
        id: &InstanceId,
        config: &SpawnConfig,
        size: TerminalSize,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<Box<dyn TerminalBackend>, TerminalError> {
        let SpawnConfig::Ssh {
            machine_id,
            working_dir,
        } = config
        else {
            return Err(TerminalError::spawn_failed(id, "not an SSH session config"));
        };

        let target = self
            .provider
            .resolve(machine_id)
            .await
            .map_err(|e| TerminalError::spawn_failed(id, e))?;

        tracing::info!(
            "Opening remote shell for {} on {} in {}",
            id,
            machine_id,
            working_dir.display()
        );

        let session = self
            .connector
            .connect(&target)
            .await
            .map_err(|e| TerminalError::spawn_failed(id, e))?;

        let pid_file = pid_file_path(id);
        let command = start_command(
            &working_dir.to_string_lossy(),
            &pid_file,
            target.default_shell.as_deref(),
        );

        let channel = match session.open_pty(size, &target.env, Some(&command)).await {
            Ok(channel) => channel,
            Err(e) => {
                session.disconnect().await;
                return Err(TerminalError::spawn_failed(id, e));
            }
        };

        let session = Arc::new(session);
        let (commands, command_rx) = mpsc::channel(64);
        tokio::spawn(drive_channel(
            id.clone(),
            channel,
            command_rx,
            events,
            session.clone(),
            pid_file.clone(),
        ));

        Ok(Box::new(SshBackend {
            commands,
            session,
            pid_file,
            probe_timeout: self.probe_timeout,
        }))
    }
}

/// Per-instance pid file on the remote machine
fn pid_file_path(id: &InstanceId) -> String {
    let safe: String = id
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("/tmp/warden-{}.pid", safe)
}

/// Record the shell pid, enter the working directory and replace ourselves with the shell
fn start_command(working_dir: &str, pid_file: &str, shell: Option<&str>) -> String {
    let shell = match shell {
        Some(shell) => shell_quote(shell),
        None => "\"${SHELL:-/bin/sh}\"".to_string(),
    };
    format!(
        "echo $$ > {} && cd {} && exec {} -l",
        shell_quote(pid_file),
        shell_quote(working_dir),
        shell
    )
}

/// Resolve the shell's working directory from its recorded pid
fn cwd_probe_command(pid_file: &str) -> String {
    format!(
        "pid=$(cat {} 2>/dev/null) && {{ readlink /proc/$pid/cwd 2>/dev/null || lsof -a -p $pid -d cwd -Fn 2>/dev/null | sed -n 's/^n//p'; }}",
        shell_quote(pid_file)
    )
}

enum ChannelCommand {
    Write(Vec<u8>),
    Resize(TerminalSize),
    Close,
}

async fn drive_channel(
    id: InstanceId,
    mut channel: Channel<Msg>,
    mut commands: mpsc::Receiver<ChannelCommand>,
    events: mpsc::Sender<BackendEvent>,
    session: Arc<SshSession>,
    pid_file: String,
) {
    let mut code = None;
    let mut closing = false;

    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { ref data }) | Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                    tracing::trace!("{} received {} bytes", id, data.len());
                    if events.send(BackendEvent::Data(Bytes::copy_from_slice(data))).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    code = Some(exit_status as i32);
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
            cmd = commands.recv(), if !closing => match cmd {
                Some(ChannelCommand::Write(data)) => {
                    if let Err(e) = channel.data(&data[..]).await {
                        tracing::warn!("Write to remote shell {} failed: {}", id, e);
                    }
                }
                Some(ChannelCommand::Resize(size)) => {
                    if let Err(e) = channel
                        .window_change(u32::from(size.cols), u32::from(size.rows), 0, 0)
                        .await
                    {
                        tracing::warn!("Resize of remote shell {} failed: {}", id, e);
                    }
                }
                Some(ChannelCommand::Close) | None => {
                    closing = true;
                    let _ = channel.eof().await;
                    if channel.close().await.is_err() {
                        break;
                    }
                }
            },
        }
    }

    tracing::info!("Remote shell for {} ended with {:?}", id, code);
    let _ = events.send(BackendEvent::Exit(code)).await;

    let cleanup = format!("rm -f {}", shell_quote(&pid_file));
    if let Err(e) = session.exec(&cleanup, DEFAULT_PROBE_TIMEOUT).await {
        tracing::debug!("Pid file cleanup for {} failed: {}", id, e);
    }
    session.disconnect().await;
}

/// A shell running on a remote PTY channel
struct SshBackend {
    commands: mpsc::Sender<ChannelCommand>,
    session: Arc<SshSession>,
    pid_file: String,
    probe_timeout: Duration,
}

impl SshBackend {
    async fn send(&self, command: ChannelCommand) -> Result<(), TerminalError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TerminalError::Closed)
    }
}

#[async_trait]
impl TerminalBackend for SshBackend {
    async fn write(&self, data: &[u8]) -> Result<(), TerminalError> {
        self.send(ChannelCommand::Write(data.to_vec())).await
    }

    async fn resize(&self, size: TerminalSize) -> Result<(), TerminalError> {
        self.send(ChannelCommand::Resize(size)).await
    }

    async fn kill(&self) -> Result<(), TerminalError> {
        match self.send(ChannelCommand::Close).await {
            // Channel task already finished
            Err(TerminalError::Closed) => Ok(()),
            other => other,
        }
    }

    async fn cwd(&self) -> Option<PathBuf> {
        match self
            .session
            .exec(&cwd_probe_command(&self.pid_file), self.probe_timeout)
            .await
        {
            Ok(output) => {
                let cwd = output.stdout_str();
                (!cwd.is_empty()).then(|| PathBuf::from(cwd))
            }
            Err(e) => {
                tracing::debug!("Remote cwd probe on {} failed: {}", self.session.machine_id(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_path_is_sanitised() {
        assert_eq!(
            pid_file_path(&InstanceId::new("abc/../x y")),
            "/tmp/warden-abc____x_y.pid"
        );
    }

    #[test]
    fn test_start_command_uses_login_shell() {
        let cmd = start_command("/home/me/it's", "/tmp/warden-a.pid", None);
        assert_eq!(
            cmd,
            r#"echo $$ > '/tmp/warden-a.pid' && cd '/home/me/it'\''s' && exec "${SHELL:-/bin/sh}" -l"#
        );

        let cmd = start_command("/srv", "/tmp/p", Some("/bin/zsh"));
        assert!(cmd.ends_with("exec '/bin/zsh' -l"));
    }

    #[test]
    fn test_cwd_probe_reads_pid_file() {
        let cmd = cwd_probe_command("/tmp/warden-a.pid");
        assert!(cmd.starts_with("pid=$(cat '/tmp/warden-a.pid'"));
        assert!(cmd.contains("/proc/$pid/cwd"));
        assert!(cmd.contains("lsof"));
    }
}
