//! Tunnel transport
//!
//! The manager drives tunnels through [`TunnelConnector`] and [`TunnelLink`]
//! so the state machine can be exercised without an SSH server. The
//! production implementation opens an SSH connection with a remote port
//! forward whose inbound connections are bridged to the local control port.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use wd_core::{MachineId, TunnelError};
use wd_ssh::{ConnectionProvider, SshConnector, SshSession};

/// Command whose echo proves the connection round trips
const PROBE_COMMAND: &str = "echo ok";

/// Opens reverse tunnels
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    /// Connect to `machine_id` and forward its `remote_port` to our `local_port`
    async fn connect(
        &self,
        machine_id: &MachineId,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Arc<dyn TunnelLink>, TunnelError>;
}

/// One established tunnel connection
#[async_trait]
pub trait TunnelLink: Send + Sync {
    /// Trivial round trip over the connection, bounded by `timeout`
    async fn probe(&self, timeout: Duration) -> Result<(), TunnelError>;

    /// Cancelled when the connection closes or errors
    fn closed(&self) -> CancellationToken;

    /// Withdraw the forward and drop the connection
    async fn close(&self);
}

/// Reverse tunnels over SSH
pub struct SshTunnelConnector {
    provider: Arc<dyn ConnectionProvider>,
    connector: SshConnector,
}

impl SshTunnelConnector {
    pub fn new(provider: Arc<dyn ConnectionProvider>, connector: SshConnector) -> Self {
        Self {
            provider,
            connector,
        }
    }
}

#[async_trait]
impl TunnelConnector for SshTunnelConnector {
    async fn connect(
        &self,
        machine_id: &MachineId,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Arc<dyn TunnelLink>, TunnelError> {
        let target = self
            .provider
            .resolve(machine_id)
            .await
            .map_err(|e| e.into_tunnel_error(machine_id))?;

        let session = self
            .connector
            .connect_with_forward(&target, remote_port, local_port)
            .await
            .map_err(|e| e.into_tunnel_error(machine_id))?;

        Ok(Arc::new(SshReverseLink {
            session,
            remote_port,
        }))
    }
}

struct SshReverseLink {
    session: SshSession,
    remote_port: u16,
}

#[async_trait]
impl TunnelLink for SshReverseLink {
    async fn probe(&self, timeout: Duration) -> Result<(), TunnelError> {
        let output = self
            .session
            .exec(PROBE_COMMAND, timeout)
            .await
            .map_err(|e| TunnelError::TransientProbeFailure(e.to_string()))?;

        if output.success() && output.stdout_str() == "ok" {
            Ok(())
        } else {
            Err(TunnelError::TransientProbeFailure(format!(
                "unexpected probe reply (status {:?})",
                output.exit_status
            )))
        }
    }

    fn closed(&self) -> CancellationToken {
        self.session.closed_token()
    }

    async fn close(&self) {
        self.session.cancel_forward(self.remote_port).await;
        self.session.disconnect().await;
    }
}
