//! Core error types for Warden

use std::path::PathBuf;
use thiserror::Error;

use crate::types::{InstanceId, MachineId};

/// Top-level error type for the Warden ecosystem
#[derive(Error, Debug)]
pub enum WdError {
    /// Terminal session error
    #[error("Terminal error: {0}")]
    Terminal(#[from] TerminalError),

    /// Reverse tunnel error
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Instance store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Viewer protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from terminal backends and the terminal manager
#[derive(Error, Debug)]
pub enum TerminalError {
    /// No live session for the instance
    #[error("Session not found: {0}")]
    NotFound(InstanceId),

    /// A live session already exists for the instance
    #[error("Session already exists: {0}")]
    AlreadyExists(InstanceId),

    /// The backend could not be started
    #[error("Spawn failed for {instance}: {reason}")]
    SpawnFailed { instance: InstanceId, reason: String },

    /// Remote shell could not be reached
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    /// The session ended while the operation was in flight
    #[error("Session closed unexpectedly")]
    Closed,

    /// I/O error against the PTY or channel
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TerminalError {
    /// Build a spawn failure from any displayable cause
    pub fn spawn_failed(instance: &InstanceId, reason: impl std::fmt::Display) -> Self {
        Self::SpawnFailed {
            instance: instance.clone(),
            reason: reason.to_string(),
        }
    }

    /// Whether this is the non-fatal "no such session" outcome
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Errors from the reverse tunnel manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// No tunnel registered for the machine or instance
    #[error("Tunnel not found: {0}")]
    NotFound(String),

    /// SSH connect, authentication or forward setup failed
    #[error("Connection failure to {machine}: {reason}")]
    ConnectionFailure { machine: MachineId, reason: String },

    /// Health probe timed out or failed; the tunnel may recover
    #[error("Health probe failed: {0}")]
    TransientProbeFailure(String),

    /// Reconnection cap reached; terminal until a forced reconnect
    #[error("Reconnection gave up after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },

    /// The underlying SSH connection closed
    #[error("Connection closed")]
    Closed,
}

/// Errors from the instance store
#[derive(Error, Debug)]
pub enum StoreError {
    /// No record for the instance
    #[error("Instance not found: {0}")]
    NotFound(InstanceId),

    /// Backend-specific failure
    #[error("Store backend failure: {0}")]
    Backend(String),
}

/// Malformed or unacceptable inbound viewer messages
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame could not be decoded
    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    /// Binary frames are not part of the viewer protocol
    #[error("Unsupported frame type")]
    UnsupportedFrame,

    /// Operation requires an active subscription
    #[error("Not subscribed to {0}")]
    NotSubscribed(InstanceId),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Machine has no SSH profile
    #[error("Unknown machine: {0}")]
    UnknownMachine(MachineId),
}
