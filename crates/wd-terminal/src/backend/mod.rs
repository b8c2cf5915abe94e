//! Terminal backends
//!
//! A backend is the live process or channel behind one instance. Spawning is
//! separated from the backend itself so the manager can be driven by an
//! in-process spawner in tests.

mod local;
mod ssh;

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use wd_core::{InstanceId, MachineId, MachineRef, TerminalError, TerminalSize};

pub use local::LocalSpawner;
pub use ssh::SshSpawner;

/// Where and how to start a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnConfig {
    /// Native shell on the control-plane host
    Local { working_dir: PathBuf },
    /// Shell channel on a remote machine
    Ssh {
        machine_id: MachineId,
        working_dir: PathBuf,
    },
}

impl SpawnConfig {
    /// Config for an instance on `machine` starting in `working_dir`
    pub fn for_machine(machine: &MachineRef, working_dir: impl Into<PathBuf>) -> Self {
        match machine {
            MachineRef::Local => SpawnConfig::Local {
                working_dir: working_dir.into(),
            },
            MachineRef::Remote { machine_id } => SpawnConfig::Ssh {
                machine_id: machine_id.clone(),
                working_dir: working_dir.into(),
            },
        }
    }

    pub fn working_dir(&self) -> &PathBuf {
        match self {
            SpawnConfig::Local { working_dir } | SpawnConfig::Ssh { working_dir, .. } => {
                working_dir
            }
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, SpawnConfig::Ssh { .. })
    }
}

/// Output of a running backend, in production order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// Bytes read from the terminal
    Data(Bytes),
    /// The process or channel ended; always the last event
    Exit(Option<i32>),
}

/// Starts backends
#[async_trait]
pub trait BackendSpawner: Send + Sync {
    /// Start a session for `id`.
    ///
    /// Output is delivered on `events`; the backend sends exactly one
    /// [`BackendEvent::Exit`] when it ends.
    async fn spawn(
        &self,
        id: &InstanceId,
        config: &SpawnConfig,
        size: TerminalSize,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<Box<dyn TerminalBackend>, TerminalError>;
}

/// A running session
#[async_trait]
pub trait TerminalBackend: Send + Sync {
    /// Send bytes to the terminal input
    async fn write(&self, data: &[u8]) -> Result<(), TerminalError>;

    /// Change the terminal dimensions
    async fn resize(&self, size: TerminalSize) -> Result<(), TerminalError>;

    /// Terminate the session; an exit event follows
    async fn kill(&self) -> Result<(), TerminalError>;

    /// Live working directory of the shell, best-effort
    async fn cwd(&self) -> Option<PathBuf>;

    /// Process id of the shell, when known
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Production spawner: local configs go to a PTY, SSH configs to a remote shell.
pub struct ShellSpawner {
    local: LocalSpawner,
    ssh: Option<SshSpawner>,
}

impl ShellSpawner {
    pub fn new(local: LocalSpawner, ssh: Option<SshSpawner>) -> Self {
        Self { local, ssh }
    }
}

#[async_trait]
impl BackendSpawner for ShellSpawner {
    async fn spawn(
        &self,
        id: &InstanceId,
        config: &SpawnConfig,
        size: TerminalSize,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<Box<dyn TerminalBackend>, TerminalError> {
        match config {
            SpawnConfig::Local { .. } => self.local.spawn(id, config, size, events).await,
            SpawnConfig::Ssh { machine_id, .. } => match &self.ssh {
                Some(ssh) => ssh.spawn(id, config, size, events).await,
                None => Err(TerminalError::spawn_failed(
                    id,
                    format!("no SSH support configured for machine {}", machine_id),
                )),
            },
        }
    }
}

/// Quote a string for a POSIX shell command line
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_config_for_machine() {
        let local = SpawnConfig::for_machine(&MachineRef::Local, "/work");
        assert!(!local.is_remote());
        assert_eq!(local.working_dir(), &PathBuf::from("/work"));

        let remote = SpawnConfig::for_machine(
            &MachineRef::Remote {
                machine_id: MachineId::new("m1"),
            },
            "/srv",
        );
        assert!(remote.is_remote());
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/tmp/it's"), r"'/tmp/it'\''s'");
        assert_eq!(shell_quote("plain"), "'plain'");
    }

    #[tokio::test]
    async fn test_ssh_config_without_ssh_support_fails() {
        let spawner = ShellSpawner::new(LocalSpawner::default(), None);
        let (tx, _rx) = mpsc::channel(1);
        let config = SpawnConfig::Ssh {
            machine_id: MachineId::new("m1"),
            working_dir: PathBuf::from("/"),
        };
        let result = spawner
            .spawn(&InstanceId::new("i1"), &config, TerminalSize::default(), tx)
            .await;
        assert!(matches!(result, Err(TerminalError::SpawnFailed { .. })));
    }
}
