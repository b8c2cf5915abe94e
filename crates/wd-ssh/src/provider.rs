//! Resolution of machine ids to SSH parameters

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

use wd_core::config::MachineProfile;
use wd_core::MachineId;

use crate::SshError;

/// Everything needed to open an SSH connection to one machine
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub machine_id: MachineId,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity_file: PathBuf,
    /// Shell to start for interactive sessions
    pub default_shell: Option<String>,
    pub env: Vec<(String, String)>,
}

impl SshTarget {
    /// `host:port` address string
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn from_profile(machine_id: &MachineId, profile: &MachineProfile) -> Self {
        let mut env: Vec<_> = profile
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();

        Self {
            machine_id: machine_id.clone(),
            host: profile.host.clone(),
            port: profile.port,
            user: profile.user.clone(),
            identity_file: profile.identity_path(),
            default_shell: profile.default_shell.clone(),
            env,
        }
    }
}

/// Source of SSH parameters (key material, host config) for machines
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Resolve a machine id to its connection parameters
    async fn resolve(&self, machine_id: &MachineId) -> Result<SshTarget, SshError>;
}

/// Provider backed by the `[machines]` table of the daemon configuration
pub struct ConfigProvider {
    machines: HashMap<String, MachineProfile>,
}

impl ConfigProvider {
    pub fn new(machines: HashMap<String, MachineProfile>) -> Self {
        Self { machines }
    }
}

#[async_trait]
impl ConnectionProvider for ConfigProvider {
    async fn resolve(&self, machine_id: &MachineId) -> Result<SshTarget, SshError> {
        self.machines
            .get(machine_id.as_str())
            .map(|profile| SshTarget::from_profile(machine_id, profile))
            .ok_or_else(|| SshError::UnknownMachine(machine_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_config_provider_resolves_profile() {
        let mut profile = MachineProfile::new("build.lan", "ci");
        profile.port = 2200;
        profile.env.insert("B".to_string(), "2".to_string());
        profile.env.insert("A".to_string(), "1".to_string());

        let provider = ConfigProvider::new(HashMap::from([("build".to_string(), profile)]));
        let target = provider.resolve(&MachineId::new("build")).await.unwrap();

        assert_eq!(target.address(), "build.lan:2200");
        assert_eq!(target.user, "ci");
        assert_eq!(target.env[0], ("A".to_string(), "1".to_string()));
    }

    #[tokio::test]
    async fn test_config_provider_unknown_machine() {
        let provider = ConfigProvider::new(HashMap::new());
        let result = provider.resolve(&MachineId::new("ghost")).await;
        assert!(matches!(result, Err(SshError::UnknownMachine(_))));
    }
}
