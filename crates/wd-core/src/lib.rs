//! wd-core: Core abstractions and configuration for Warden
//!
//! This crate provides the shared identifiers, error taxonomy, configuration
//! structures, instance store contract and viewer wire protocol used by the
//! terminal, tunnel and server crates.

pub mod config;
pub mod error;
pub mod paths;
pub mod protocol;
pub mod store;
pub mod time;
pub mod types;

pub use error::{ConfigError, ProtocolError, StoreError, TerminalError, TunnelError, WdError};
pub use types::{
    ConnectionId, InstanceId, InstanceStatus, MachineId, MachineRef, SignalSource, TerminalSize,
    TunnelHealth,
};
