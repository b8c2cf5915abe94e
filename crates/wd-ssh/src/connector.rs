//! Outbound SSH connections
//!
//! Establishes authenticated client sessions to remote machines. A session can
//! open interactive shell channels, run short probe commands, and carry a
//! remote (reverse) port forward whose inbound connections are bridged to a
//! port on the control-plane host.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use wd_core::{MachineId, TerminalError, TerminalSize, TunnelError};

use crate::SshTarget;

/// Terminal type requested for interactive channels
const TERM: &str = "xterm-256color";

/// SSH errors that callers may need to tell apart
#[derive(Debug, Error)]
pub enum SshError {
    /// Private key file missing or unreadable
    #[error("Private key not found at {path}: {reason}")]
    KeyNotFound { path: String, reason: String },

    /// Server rejected our key
    #[error("Authentication rejected by {0}")]
    AuthRejected(String),

    /// Server key does not match known_hosts
    #[error("Host key verification failed: {message}")]
    HostKeyRejected { message: String },

    /// Connect did not complete in time
    #[error("Connection to {0} timed out")]
    Timeout(String),

    /// No SSH profile for the machine
    #[error("Unknown machine: {0}")]
    UnknownMachine(MachineId),

    /// The connection is gone
    #[error("Connection closed")]
    Closed,

    /// Protocol or transport failure
    #[error("SSH error: {0}")]
    Ssh(String),
}

impl From<russh::Error> for SshError {
    fn from(e: russh::Error) -> Self {
        SshError::Ssh(e.to_string())
    }
}

impl SshError {
    /// Express as a tunnel connection failure for `machine`
    pub fn into_tunnel_error(self, machine: &MachineId) -> TunnelError {
        match self {
            SshError::Closed => TunnelError::Closed,
            other => TunnelError::ConnectionFailure {
                machine: machine.clone(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<SshError> for TerminalError {
    fn from(e: SshError) -> Self {
        match e {
            SshError::Closed => TerminalError::Closed,
            other => TerminalError::ConnectionFailure(other.to_string()),
        }
    }
}

/// Result of a remote command
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_status: Option<u32>,
    pub stdout: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// Stdout as trimmed text
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Opens SSH client sessions
#[derive(Debug, Clone)]
pub struct SshConnector {
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Connect and authenticate without any port forward.
    pub async fn connect(&self, target: &SshTarget) -> Result<SshSession, SshError> {
        self.connect_inner(target, None).await
    }

    /// Connect, authenticate and request a remote forward of
    /// `127.0.0.1:<remote_port>` on the machine to `127.0.0.1:<local_port>` here.
    pub async fn connect_with_forward(
        &self,
        target: &SshTarget,
        remote_port: u16,
        local_port: u16,
    ) -> Result<SshSession, SshError> {
        let mut session = self.connect_inner(target, Some(local_port)).await?;

        let requested = tokio::time::timeout(
            self.connect_timeout,
            session.handle.tcpip_forward("127.0.0.1", u32::from(remote_port)),
        )
        .await
        .map_err(|_| SshError::Timeout(target.address()))?;

        if let Err(e) = requested {
            session.disconnect().await;
            return Err(SshError::Ssh(format!(
                "remote forward of port {} refused: {}",
                remote_port, e
            )));
        }

        tracing::info!(
            "Reverse forward {}:{} -> 127.0.0.1:{} established",
            target.machine_id,
            remote_port,
            local_port
        );
        Ok(session)
    }

    async fn connect_inner(
        &self,
        target: &SshTarget,
        forward_to: Option<u16>,
    ) -> Result<SshSession, SshError> {
        let key = load_key(target)?;

        let closed = CancellationToken::new();
        let handler = ClientHandler {
            host: target.host.clone(),
            port: target.port,
            forward_to,
            closed: closed.clone(),
        };

        tracing::debug!("Connecting to {} ({})", target.machine_id, target.address());
        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(Arc::new(Config::default()), target.address(), handler),
        )
        .await
        .map_err(|_| SshError::Timeout(target.address()))?
        .map_err(|e| {
            let message = e.to_string();
            if message.contains("host key") || message.contains("server key") {
                SshError::HostKeyRejected { message }
            } else {
                SshError::Ssh(format!("Failed to connect to {}: {}", target.address(), message))
            }
        })?;

        tracing::debug!("Authenticating as user '{}'", target.user);
        let authenticated = tokio::time::timeout(
            self.connect_timeout,
            handle.authenticate_publickey(target.user.clone(), Arc::new(key)),
        )
        .await
        .map_err(|_| SshError::Timeout(target.address()))??;

        if !authenticated {
            return Err(SshError::AuthRejected(target.address()));
        }

        Ok(SshSession {
            machine_id: target.machine_id.clone(),
            handle,
            closed,
        })
    }
}

fn load_key(target: &SshTarget) -> Result<KeyPair, SshError> {
    let path = &target.identity_file;
    if !path.exists() {
        return Err(SshError::KeyNotFound {
            path: path.display().to_string(),
            reason: "file does not exist".to_string(),
        });
    }

    russh_keys::load_secret_key(path, None).map_err(|e| SshError::KeyNotFound {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// An authenticated SSH connection to one machine
pub struct SshSession {
    machine_id: MachineId,
    handle: Handle<ClientHandler>,
    closed: CancellationToken,
}

impl SshSession {
    pub fn machine_id(&self) -> &MachineId {
        &self.machine_id
    }

    /// Token cancelled when the underlying connection ends
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Open an interactive channel with a PTY running `command`
    /// (or the login shell when `command` is `None`).
    pub async fn open_pty(
        &self,
        size: TerminalSize,
        env: &[(String, String)],
        command: Option<&str>,
    ) -> Result<Channel<Msg>, SshError> {
        if self.is_closed() {
            return Err(SshError::Closed);
        }

        let channel = self.handle.channel_open_session().await?;

        for (key, value) in env {
            // Servers commonly refuse env requests; that is not fatal.
            if let Err(e) = channel.set_env(false, key.as_str(), value.as_str()).await {
                tracing::debug!("set_env {} refused: {}", key, e);
            }
        }

        channel
            .request_pty(
                false,
                TERM,
                u32::from(size.cols),
                u32::from(size.rows),
                0,
                0,
                &[],
            )
            .await?;

        match command {
            Some(command) => channel.exec(true, command).await?,
            None => channel.request_shell(true).await?,
        }

        Ok(channel)
    }

    /// Run a command and collect its stdout, bounded by `timeout`.
    pub async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, SshError> {
        if self.is_closed() {
            return Err(SshError::Closed);
        }

        let run = async {
            let mut channel = self.handle.channel_open_session().await?;
            channel.exec(true, command).await?;

            let mut output = ExecOutput::default();
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                    ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
                    _ => {}
                }
            }
            Ok::<_, SshError>(output)
        };

        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| SshError::Timeout(format!("{} ({})", self.machine_id, command)))?
    }

    /// Withdraw a remote forward previously requested on this session
    pub async fn cancel_forward(&self, remote_port: u16) {
        if let Err(e) = self
            .handle
            .cancel_tcpip_forward("127.0.0.1", u32::from(remote_port))
            .await
        {
            tracing::debug!("cancel forward on {} failed: {}", self.machine_id, e);
        }
    }

    /// Close the connection
    pub async fn disconnect(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await
        {
            tracing::debug!("disconnect from {} failed: {}", self.machine_id, e);
        }
        self.closed.cancel();
    }
}

/// SSH client handler
struct ClientHandler {
    host: String,
    port: u16,
    /// Local port that forwarded connections are bridged to
    forward_to: Option<u16>,
    /// Cancelled when the connection task drops the handler
    closed: CancellationToken,
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    /// Verify the server key against ~/.ssh/known_hosts.
    ///
    /// Unknown hosts are accepted with a warning; a changed key is rejected.
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) => {
                tracing::warn!(
                    "Host {}:{} not in known_hosts (fingerprint {}), accepting",
                    self.host,
                    self.port,
                    server_public_key.fingerprint()
                );
                Ok(true)
            }
            Err(e) => {
                tracing::error!("Host key check for {} failed: {}", self.host, e);
                Err(anyhow::anyhow!("server host key rejected: {}", e))
            }
        }
    }

    /// Bridge a connection arriving on the remote forward to the local port
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let Some(local_port) = self.forward_to else {
            tracing::warn!(
                "Unexpected forwarded connection to {}:{}",
                connected_address,
                connected_port
            );
            return Ok(());
        };

        tracing::debug!(
            "Forwarded connection {}:{} from {}:{}",
            connected_address,
            connected_port,
            originator_address,
            originator_port
        );

        tokio::spawn(async move {
            let mut local = match TcpStream::connect(("127.0.0.1", local_port)).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("Cannot reach local port {}: {}", local_port, e);
                    let _ = channel.close().await;
                    return;
                }
            };
            let mut remote = channel.into_stream();
            if let Err(e) = tokio::io::copy_bidirectional(&mut remote, &mut local).await {
                tracing::debug!("Forwarded connection ended: {}", e);
            }
        });

        Ok(())
    }
}
