//! wd-terminal: Live terminal sessions for Warden instances
//!
//! A [`TerminalManager`] owns at most one live session per instance. Sessions
//! run on a [`TerminalBackend`], either a local PTY or a shell channel on a
//! remote machine reached over SSH, and keep a bounded output history so
//! late viewers can replay recent context.

pub mod backend;
mod history;
mod manager;

pub use backend::{
    BackendEvent, BackendSpawner, LocalSpawner, ShellSpawner, SpawnConfig, SshSpawner,
    TerminalBackend,
};
pub use history::OutputHistory;
pub use manager::{Attachment, SessionInfo, SessionOutput, TerminalEvent, TerminalManager};
