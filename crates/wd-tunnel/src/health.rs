//! Tunnel health state machine
//!
//! Pure bookkeeping: every method applies one observation and returns the
//! resulting transition, if the state changed. The manager owns the timers
//! and the connection; this type only decides what the observations mean.
//!
//! ```text
//! healthy --probe fails--> degraded --probe fails--> disconnected
//!    ^                                                   |
//!    |                                         reconnect attempt
//!    +--------------- connected ---- reconnecting <------+
//! ```

use wd_core::protocol::{TunnelStateChange, TunnelStatus};
use wd_core::time::current_time_millis;
use wd_core::{MachineId, TunnelError, TunnelHealth};

/// Health bookkeeping for one machine tunnel
#[derive(Debug, Clone)]
pub struct HealthTracker {
    machine_id: MachineId,
    state: TunnelHealth,
    reconnect_attempts: u32,
    last_error: Option<String>,
    last_seen_at: Option<u64>,
    last_health_check: Option<u64>,
    exhausted: bool,
}

impl HealthTracker {
    /// Tracker for a freshly established tunnel
    pub fn established(machine_id: MachineId) -> Self {
        Self {
            machine_id,
            state: TunnelHealth::Healthy,
            reconnect_attempts: 0,
            last_error: None,
            last_seen_at: Some(current_time_millis()),
            last_health_check: None,
            exhausted: false,
        }
    }

    pub fn state(&self) -> TunnelHealth {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Reconnection gave up and waits for a forced reconnect
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Probing only makes sense on a live connection
    pub fn should_probe(&self) -> bool {
        matches!(self.state, TunnelHealth::Healthy | TunnelHealth::Degraded)
    }

    fn transition(&mut self, new_state: TunnelHealth) -> Option<TunnelStateChange> {
        let previous = self.state;
        if previous == new_state {
            return None;
        }
        self.state = new_state;
        Some(TunnelStateChange {
            machine_id: self.machine_id.clone(),
            previous_state: previous,
            new_state,
            error: self.last_error.clone(),
            timestamp: current_time_millis(),
        })
    }

    /// A probe round trip succeeded
    pub fn probe_succeeded(&mut self) -> Option<TunnelStateChange> {
        let now = current_time_millis();
        self.last_health_check = Some(now);
        self.last_seen_at = Some(now);
        self.mark_healthy()
    }

    /// A probe timed out or failed.
    ///
    /// Returns the transition and whether reconnection should start.
    pub fn probe_failed(&mut self, error: &TunnelError) -> (Option<TunnelStateChange>, bool) {
        self.last_health_check = Some(current_time_millis());
        self.last_error = Some(error.to_string());

        match self.state {
            TunnelHealth::Healthy => (self.transition(TunnelHealth::Degraded), false),
            TunnelHealth::Degraded => (self.transition(TunnelHealth::Disconnected), true),
            // Reconnection already owns the tunnel
            TunnelHealth::Disconnected | TunnelHealth::Reconnecting => (None, false),
        }
    }

    /// The SSH connection closed or errored
    pub fn connection_lost(&mut self, reason: impl Into<String>) -> Option<TunnelStateChange> {
        self.last_error = Some(reason.into());
        self.transition(TunnelHealth::Disconnected)
    }

    /// A reconnection attempt is about to start
    pub fn begin_reconnect(&mut self) -> Option<TunnelStateChange> {
        self.reconnect_attempts += 1;
        self.transition(TunnelHealth::Reconnecting)
    }

    /// A reconnection attempt failed
    pub fn reconnect_failed(&mut self, error: &TunnelError) -> Option<TunnelStateChange> {
        self.last_error = Some(error.to_string());
        self.transition(TunnelHealth::Disconnected)
    }

    /// The attempt cap was reached
    pub fn give_up(&mut self) -> Option<TunnelStateChange> {
        self.exhausted = true;
        self.last_error = Some(
            TunnelError::ExhaustedRetries {
                attempts: self.reconnect_attempts,
            }
            .to_string(),
        );
        let change = self.transition(TunnelHealth::Disconnected);
        // Report the terminal error even when already disconnected
        change.or_else(|| {
            Some(TunnelStateChange {
                machine_id: self.machine_id.clone(),
                previous_state: self.state,
                new_state: self.state,
                error: self.last_error.clone(),
                timestamp: current_time_millis(),
            })
        })
    }

    /// A new connection is up
    pub fn reconnected(&mut self) -> Option<TunnelStateChange> {
        self.last_seen_at = Some(current_time_millis());
        self.mark_healthy()
    }

    /// Clear the attempt counter so reconnection may resume
    pub fn reset_attempts(&mut self) {
        self.reconnect_attempts = 0;
        self.exhausted = false;
    }

    fn mark_healthy(&mut self) -> Option<TunnelStateChange> {
        self.reconnect_attempts = 0;
        self.last_error = None;
        self.exhausted = false;
        self.transition(TunnelHealth::Healthy)
    }

    /// Snapshot for status queries
    pub fn status(&self, remote_port: u16, local_port: u16, instance_count: usize) -> TunnelStatus {
        TunnelStatus {
            machine_id: self.machine_id.clone(),
            health_state: self.state,
            remote_port,
            local_port,
            instance_count,
            last_seen_at: self.last_seen_at,
            last_health_check: self.last_health_check,
            reconnect_attempts: self.reconnect_attempts,
            error: self.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_error() -> TunnelError {
        TunnelError::TransientProbeFailure("timed out".to_string())
    }

    #[test]
    fn test_two_failed_probes_disconnect() {
        let mut tracker = HealthTracker::established(MachineId::new("m"));

        let (change, reconnect) = tracker.probe_failed(&probe_error());
        assert_eq!(change.unwrap().new_state, TunnelHealth::Degraded);
        assert!(!reconnect);

        let (change, reconnect) = tracker.probe_failed(&probe_error());
        let change = change.unwrap();
        assert_eq!(change.previous_state, TunnelHealth::Degraded);
        assert_eq!(change.new_state, TunnelHealth::Disconnected);
        assert!(change.error.unwrap().contains("timed out"));
        assert!(reconnect);
    }

    #[test]
    fn test_success_restores_health_and_resets() {
        let mut tracker = HealthTracker::established(MachineId::new("m"));
        tracker.probe_failed(&probe_error());

        let change = tracker.probe_succeeded().unwrap();
        assert_eq!(change.new_state, TunnelHealth::Healthy);
        assert!(change.error.is_none());
        assert_eq!(tracker.reconnect_attempts(), 0);
        assert!(tracker.last_error().is_none());
    }

    #[test]
    fn test_reconnect_path_counts_attempts() {
        let mut tracker = HealthTracker::established(MachineId::new("m"));
        tracker.connection_lost("reset by peer");

        tracker.begin_reconnect();
        tracker.reconnect_failed(&TunnelError::Closed);
        assert_eq!(tracker.begin_reconnect().unwrap().new_state, TunnelHealth::Reconnecting);
        assert_eq!(tracker.reconnect_attempts(), 2);

        let change = tracker.reconnected().unwrap();
        assert_eq!(change.previous_state, TunnelHealth::Reconnecting);
        assert_eq!(tracker.reconnect_attempts(), 0);
    }

    #[test]
    fn test_give_up_is_reported_and_sticky_until_reset() {
        let mut tracker = HealthTracker::established(MachineId::new("m"));
        tracker.connection_lost("gone");
        tracker.begin_reconnect();
        tracker.reconnect_failed(&TunnelError::Closed);

        let change = tracker.give_up().unwrap();
        assert_eq!(change.new_state, TunnelHealth::Disconnected);
        assert!(change.error.unwrap().contains("gave up after 1"));
        assert!(tracker.is_exhausted());

        tracker.reset_attempts();
        assert!(!tracker.is_exhausted());
        assert_eq!(tracker.reconnect_attempts(), 0);
    }

    #[test]
    fn test_probe_failure_ignored_while_reconnecting() {
        let mut tracker = HealthTracker::established(MachineId::new("m"));
        tracker.connection_lost("gone");
        tracker.begin_reconnect();

        let (change, reconnect) = tracker.probe_failed(&probe_error());
        assert!(change.is_none());
        assert!(!reconnect);
        assert!(!tracker.should_probe());
    }
}
