//! Viewer protocol for the realtime gateway
//!
//! JSON text frames over a persistent duplex connection. Every frame carries
//! a `type` tag; payload fields are camelCase. Terminal bytes travel as JSON
//! byte arrays so partial UTF-8 sequences survive intact.

use serde::{Deserialize, Serialize};

use crate::types::{
    ConnectionId, InstanceId, InstanceStatus, MachineId, SignalSource, TunnelHealth,
};

/// Frame sent by a viewer to the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Start receiving output for an instance
    Subscribe { instance_id: InstanceId },

    /// Stop receiving output for an instance
    Unsubscribe { instance_id: InstanceId },

    /// Keystrokes for an instance (honoured only from the lock holder)
    Input {
        instance_id: InstanceId,
        data: InputData,
    },

    /// Resize an instance's terminal
    Resize {
        instance_id: InstanceId,
        cols: u16,
        rows: u16,
    },

    /// Ask for the input lock
    RequestLock { instance_id: InstanceId },

    /// Give up the input lock
    ReleaseLock { instance_id: InstanceId },

    /// Keepalive
    Ping,
}

/// Input payload: either text or raw bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputData {
    Text(String),
    Bytes(Vec<u8>),
}

impl InputData {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            InputData::Text(s) => s.into_bytes(),
            InputData::Bytes(b) => b,
        }
    }
}

/// Frame sent by the gateway to a viewer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First frame on every connection
    #[serde(rename = "connected")]
    Connected { connection_id: ConnectionId },

    /// Terminal output (history replay arrives as the first `data` frame)
    #[serde(rename = "data")]
    Data {
        instance_id: InstanceId,
        data: Vec<u8>,
    },

    /// Session ended
    #[serde(rename = "exit")]
    Exit {
        instance_id: InstanceId,
        code: Option<i32>,
    },

    /// This viewer now holds the input lock
    #[serde(rename = "lockGranted")]
    LockGranted { instance_id: InstanceId },

    /// Current lock state as seen by this viewer
    #[serde(rename = "lockStatus")]
    LockStatus {
        instance_id: InstanceId,
        has_lock: bool,
        holder: Option<ConnectionId>,
    },

    /// The holder released the lock
    #[serde(rename = "lockReleased")]
    LockReleased { instance_id: InstanceId },

    /// Lock request refused because another viewer holds it
    #[serde(rename = "lockDenied")]
    LockDenied {
        instance_id: InstanceId,
        holder: Option<ConnectionId>,
    },

    /// Live working directory changed
    #[serde(rename = "cwd:changed")]
    CwdChanged {
        instance_id: InstanceId,
        cwd: String,
    },

    /// Instance session is gone
    #[serde(rename = "instance:closed")]
    InstanceClosed {
        instance_id: InstanceId,
        code: Option<i32>,
    },

    /// Authoritative status changed
    #[serde(rename = "status:changed")]
    StatusChanged(StatusChange),

    /// Reverse tunnel health transition
    #[serde(rename = "tunnel:state")]
    TunnelState(TunnelStateChange),

    /// Typed error; the connection stays open
    #[serde(rename = "error")]
    Error {
        code: ErrorCode,
        message: String,
        instance_id: Option<InstanceId>,
    },

    /// Keepalive reply
    #[serde(rename = "pong")]
    Pong,
}

impl ServerMessage {
    /// Instance this frame is about, if any
    pub fn instance_id(&self) -> Option<&InstanceId> {
        match self {
            ServerMessage::Data { instance_id, .. }
            | ServerMessage::Exit { instance_id, .. }
            | ServerMessage::LockGranted { instance_id }
            | ServerMessage::LockStatus { instance_id, .. }
            | ServerMessage::LockReleased { instance_id }
            | ServerMessage::LockDenied { instance_id, .. }
            | ServerMessage::CwdChanged { instance_id, .. }
            | ServerMessage::InstanceClosed { instance_id, .. } => Some(instance_id),
            ServerMessage::StatusChanged(change) => Some(&change.instance_id),
            ServerMessage::Error { instance_id, .. } => instance_id.as_ref(),
            ServerMessage::Connected { .. } | ServerMessage::TunnelState(_) | ServerMessage::Pong => {
                None
            }
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>, instance_id: Option<InstanceId>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            instance_id,
        }
    }
}

/// Error codes carried by `error` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame could not be parsed
    InvalidMessage,
    /// Instance or session does not exist
    NotFound,
    /// Operation needs a subscription first
    NotSubscribed,
    /// Session could not be started
    SpawnFailed,
    /// Anything else
    Internal,
}

/// Accepted status transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub instance_id: InstanceId,
    pub previous: InstanceStatus,
    pub status: InstanceStatus,
    pub source: SignalSource,
    pub reason: String,
    /// Unix milliseconds
    pub timestamp: u64,
}

/// Tunnel health transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStateChange {
    pub machine_id: MachineId,
    pub previous_state: TunnelHealth,
    pub new_state: TunnelHealth,
    pub error: Option<String>,
    /// Unix milliseconds
    pub timestamp: u64,
}

/// Snapshot of one machine tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    pub machine_id: MachineId,
    pub health_state: TunnelHealth,
    pub remote_port: u16,
    pub local_port: u16,
    pub instance_count: usize,
    pub last_seen_at: Option<u64>,
    pub last_health_check: Option<u64>,
    pub reconnect_attempts: u32,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","instanceId":"a1"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { instance_id } if instance_id.as_str() == "a1"));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"requestLock","instanceId":"a1"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::RequestLock { .. }));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"resize","instanceId":"a1","cols":120,"rows":40}"#)
                .unwrap();
        assert!(matches!(msg, ClientMessage::Resize { cols: 120, rows: 40, .. }));
    }

    #[test]
    fn test_input_accepts_text_or_bytes() {
        let text: ClientMessage =
            serde_json::from_str(r#"{"type":"input","instanceId":"a","data":"ls\r"}"#).unwrap();
        let bytes: ClientMessage =
            serde_json::from_str(r#"{"type":"input","instanceId":"a","data":[108,115,13]}"#)
                .unwrap();

        let (ClientMessage::Input { data: a, .. }, ClientMessage::Input { data: b, .. }) =
            (text, bytes)
        else {
            panic!("expected input frames");
        };
        assert_eq!(a.into_bytes(), b.into_bytes());
    }

    #[test]
    fn test_server_message_tags() {
        let cwd = ServerMessage::CwdChanged {
            instance_id: InstanceId::new("a"),
            cwd: "/tmp".to_string(),
        };
        let json = serde_json::to_value(&cwd).unwrap();
        assert_eq!(json["type"], "cwd:changed");
        assert_eq!(json["instanceId"], "a");

        let status = ServerMessage::LockStatus {
            instance_id: InstanceId::new("a"),
            has_lock: false,
            holder: Some(ConnectionId::new("c1")),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["type"], "lockStatus");
        assert_eq!(json["hasLock"], false);
        assert_eq!(json["holder"], "c1");
    }

    #[test]
    fn test_tunnel_state_frame_is_flat() {
        let frame = ServerMessage::TunnelState(TunnelStateChange {
            machine_id: MachineId::new("m"),
            previous_state: TunnelHealth::Healthy,
            new_state: TunnelHealth::Degraded,
            error: Some("probe timed out".to_string()),
            timestamp: 42,
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "tunnel:state");
        assert_eq!(json["machineId"], "m");
        assert_eq!(json["newState"], "degraded");
    }

    #[test]
    fn test_unknown_client_message_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"launch"}"#).is_err());
    }
}
