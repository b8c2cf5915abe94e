//! Wall-clock timestamps
//!
//! Timestamps crossing crate or wire boundaries are Unix milliseconds.
//! Durations measured inside one process use `tokio::time::Instant` instead.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds; 0 if the clock is before the epoch.
///
/// # Examples
/// ```
/// use wd_core::time::current_time_millis;
///
/// assert!(current_time_millis() > 0);
/// ```
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_do_not_go_backwards() {
        let first = current_time_millis();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(current_time_millis() >= first);
    }
}
