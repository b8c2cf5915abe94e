//! Control-plane daemon configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use super::MachineProfile;

/// Configuration for the Warden daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket surface binds to
    pub bind_address: String,

    /// Bytes of terminal output retained per session for replay
    pub history_capacity: usize,

    /// Viewer gateway settings
    pub gateway: GatewayConfig,

    /// Reverse tunnel settings
    pub tunnel: TunnelConfig,

    /// Status reconciliation settings
    pub status: StatusConfig,

    /// Directory of stored agent sessions, one encoded folder per project
    pub projects_dir: Option<PathBuf>,

    /// SSH profiles keyed by machine id
    pub machines: HashMap<String, MachineProfile>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:3456".to_string(),
            history_capacity: 256 * 1024,
            gateway: GatewayConfig::default(),
            tunnel: TunnelConfig::default(),
            status: StatusConfig::default(),
            projects_dir: None,
            machines: HashMap::new(),
        }
    }
}

/// Gateway tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// How often subscribed instances are probed for their working directory
    #[serde(with = "duration_millis")]
    pub cwd_poll_interval: Duration,

    /// Quiet period before a changed working directory is persisted
    #[serde(with = "duration_millis")]
    pub cwd_persist_debounce: Duration,

    /// Capacity of the gateway-wide event broadcast
    pub event_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cwd_poll_interval: Duration::from_secs(2),
            cwd_persist_debounce: Duration::from_millis(1500),
            event_capacity: 1024,
        }
    }
}

/// Reverse tunnel tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Port the remote side listens on
    pub remote_port: u16,

    /// Control-plane port that remote connections are bridged to
    pub local_port: u16,

    /// Interval between health probes
    #[serde(with = "duration_secs")]
    pub health_interval: Duration,

    /// Deadline for a single health probe
    #[serde(with = "duration_millis")]
    pub probe_timeout: Duration,

    /// Deadline for SSH connect plus forward setup
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Reconnection attempts before giving up
    pub max_reconnect_attempts: u32,

    /// Backoff between reconnection attempts
    pub backoff: BackoffConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            remote_port: 3457,
            local_port: 3456,
            health_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_millis(5000),
            connect_timeout: Duration::from_secs(15),
            max_reconnect_attempts: 5,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

/// How terminal activity competes with hook signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityPolicy {
    /// Activity is ignored while a hook arrived within the quiet window
    HookPriority,
    /// Activity always promotes the instance to working
    ActivityWins,
}

/// Status reconciliation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Working instances with no activity for this long are demoted to idle
    #[serde(with = "duration_secs")]
    pub inactivity_timeout: Duration,

    /// How long a hook signal keeps activity signals from overriding it
    #[serde(with = "duration_secs")]
    pub hook_quiet_window: Duration,

    /// Precedence between terminal activity and hooks
    pub activity_policy: ActivityPolicy,

    /// Interval of the inactivity sweep
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,

    /// A reversal between the same two statuses within this window is an oscillation
    #[serde(with = "duration_millis")]
    pub oscillation_window: Duration,

    /// Different sources disagreeing within this window is a source conflict
    #[serde(with = "duration_millis")]
    pub source_conflict_window: Duration,

    /// Transitions retained per instance for conflict diagnostics
    pub timeline_capacity: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(30),
            hook_quiet_window: Duration::from_secs(15),
            activity_policy: ActivityPolicy::HookPriority,
            sweep_interval: Duration::from_millis(5000),
            oscillation_window: Duration::from_millis(5000),
            source_conflict_window: Duration::from_millis(2000),
            timeline_capacity: 100,
        }
    }
}
