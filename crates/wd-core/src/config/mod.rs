//! Configuration management for Warden

mod machine;
pub mod serde_utils;
mod server;

pub use machine::MachineProfile;
pub use server::{
    ActivityPolicy, BackoffConfig, GatewayConfig, ServerConfig, StatusConfig, TunnelConfig,
};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("warden")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_config() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config::<ServerConfig>(&dir.path().join("nope.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_save_then_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = ServerConfig::default();
        config.bind_address = "127.0.0.1:9999".to_string();
        config
            .machines
            .insert("gpu".to_string(), MachineProfile::new("gpu.lan", "dev"));
        save_config(&path, &config).unwrap();

        let loaded: ServerConfig = load_config(&path).unwrap();
        assert_eq!(loaded.bind_address, "127.0.0.1:9999");
        assert_eq!(loaded.machines["gpu"].host, "gpu.lan");
        assert_eq!(loaded.tunnel.remote_port, config.tunnel.remote_port);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            bind_address = "0.0.0.0:4000"

            [status]
            inactivity_timeout = 45
            activity_policy = "activity_wins"
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_address, "0.0.0.0:4000");
        assert_eq!(config.status.inactivity_timeout.as_secs(), 45);
        assert_eq!(config.status.activity_policy, ActivityPolicy::ActivityWins);
        assert_eq!(
            config.gateway.cwd_poll_interval,
            GatewayConfig::default().cwd_poll_interval
        );
    }
}
