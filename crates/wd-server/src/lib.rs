//! wd-server: The Warden control plane
//!
//! Ties the terminal manager, the reverse tunnel manager and the instance
//! store together behind a [`ControlPlane`], serves viewers through the
//! realtime [`Gateway`] and reconciles instance status from hooks, terminal
//! activity and inactivity.

pub mod control;
pub mod gateway;
pub mod http;
pub mod status;

pub use control::{ControlPlane, CreateInstance};
pub use gateway::Gateway;
pub use status::{ConflictAnalyzer, ConflictReport, HookOutcome, HookSignal, StatusReconciler};
