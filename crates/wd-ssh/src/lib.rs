//! wd-ssh: SSH plumbing shared by remote terminals and reverse tunnels
//!
//! Machines are resolved to connection parameters through a
//! [`ConnectionProvider`]; [`SshConnector`] turns those parameters into an
//! authenticated [`SshSession`] that can open shells, run probe commands and
//! carry remote port forwards back to the control plane.

mod connector;
mod provider;

pub use connector::{ExecOutput, SshConnector, SshError, SshSession};
pub use provider::{ConfigProvider, ConnectionProvider, SshTarget};
