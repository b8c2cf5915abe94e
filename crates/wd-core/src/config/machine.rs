//! Remote machine SSH profiles

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// SSH parameters for a remote machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineProfile {
    /// Host name or address
    pub host: String,

    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Login user
    pub user: String,

    /// Private key used for authentication (defaults to ~/.ssh/id_ed25519)
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    /// Shell to start for remote sessions (defaults to the login shell)
    #[serde(default)]
    pub default_shell: Option<String>,

    /// Extra environment for remote sessions
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl MachineProfile {
    /// Create a profile with the default port and key
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_ssh_port(),
            user: user.into(),
            identity_file: None,
            default_shell: None,
            env: HashMap::new(),
        }
    }

    /// `host:port` address string
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Key file to authenticate with
    pub fn identity_path(&self) -> PathBuf {
        self.identity_file.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_default()
                .join(".ssh")
                .join("id_ed25519")
        })
    }
}
