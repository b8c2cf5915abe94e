//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new identifier
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the raw ID string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Unique identifier for a managed agent instance
    InstanceId
);

string_id!(
    /// Unique identifier for a remote machine
    MachineId
);

string_id!(
    /// Identifier for one viewer connection to the gateway
    ConnectionId
);

impl ConnectionId {
    /// Allocate a fresh random connection id
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Where an instance runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MachineRef {
    /// The control-plane host itself
    #[default]
    Local,
    /// A machine reachable over SSH
    Remote {
        #[serde(rename = "machineId")]
        machine_id: MachineId,
    },
}

impl MachineRef {
    /// Remote machine id, if any
    pub fn machine_id(&self) -> Option<&MachineId> {
        match self {
            MachineRef::Local => None,
            MachineRef::Remote { machine_id } => Some(machine_id),
        }
    }

    /// Whether this instance needs a callback tunnel
    pub fn is_remote(&self) -> bool {
        matches!(self, MachineRef::Remote { .. })
    }
}

/// Authoritative instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Idle,
    Working,
    Error,
    Disconnected,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Idle => "idle",
            InstanceStatus::Working => "working",
            InstanceStatus::Error => "error",
            InstanceStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "idle" => Ok(InstanceStatus::Idle),
            "working" => Ok(InstanceStatus::Working),
            "error" => Ok(InstanceStatus::Error),
            "disconnected" => Ok(InstanceStatus::Disconnected),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// Origin of a status signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalSource {
    /// Push notification from the agent process
    Hook,
    /// Output observed on a local terminal session
    LocalPoll,
    /// Output observed on a remote terminal session
    RemotePoll,
    /// Inactivity timeout
    Timeout,
}

impl fmt::Display for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalSource::Hook => "hook",
            SignalSource::LocalPoll => "local-poll",
            SignalSource::RemotePoll => "remote-poll",
            SignalSource::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Health of a machine's reverse tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelHealth {
    Healthy,
    Degraded,
    Disconnected,
    Reconnecting,
}

impl fmt::Display for TunnelHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelHealth::Healthy => "healthy",
            TunnelHealth::Degraded => "degraded",
            TunnelHealth::Disconnected => "disconnected",
            TunnelHealth::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of rows
    pub rows: u16,
    /// Number of columns
    pub cols: u16,
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            InstanceStatus::Idle,
            InstanceStatus::Working,
            InstanceStatus::Error,
            InstanceStatus::Disconnected,
        ] {
            assert_eq!(status.as_str().parse::<InstanceStatus>().unwrap(), status);
        }
        assert!("busy".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn test_signal_source_wire_names() {
        assert_eq!(
            serde_json::to_string(&SignalSource::LocalPoll).unwrap(),
            r#""local-poll""#
        );
        assert_eq!(format!("{}", SignalSource::RemotePoll), "remote-poll");
    }

    #[test]
    fn test_machine_ref_serialization() {
        let remote = MachineRef::Remote {
            machine_id: MachineId::new("gpu-box"),
        };
        let json = serde_json::to_string(&remote).unwrap();
        assert_eq!(json, r#"{"kind":"remote","machineId":"gpu-box"}"#);
        let local: MachineRef = serde_json::from_str(r#"{"kind":"local"}"#).unwrap();
        assert!(!local.is_remote());
        assert_eq!(remote.machine_id().unwrap().as_str(), "gpu-box");
    }

    #[test]
    fn test_connection_ids_are_unique() {
        assert_ne!(ConnectionId::random(), ConnectionId::random());
    }
}
