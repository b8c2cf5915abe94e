//! wd-tunnel: Reverse tunnels from remote machines back to the control plane
//!
//! The control plane only has outbound SSH access to remote machines. For
//! processes there to call back, each machine gets one shared SSH connection
//! carrying a remote port forward to the local control endpoint. The
//! [`TunnelManager`] shares that connection between all instances on the
//! machine, probes it periodically and reconnects it with exponential
//! backoff when it breaks.

mod backoff;
mod health;
mod link;
mod manager;

pub use backoff::ExponentialBackoff;
pub use health::HealthTracker;
pub use link::{SshTunnelConnector, TunnelConnector, TunnelLink};
pub use manager::{TunnelHandle, TunnelManager};
