//! Status conflict diagnostics
//!
//! Keeps a bounded timeline of status proposals per instance and flags two
//! patterns between consecutive entries:
//!
//! - **source conflict**: two different sources assert different statuses
//!   within the source-conflict window
//! - **oscillation**: a transition reverses the previous one between the same
//!   two statuses within the oscillation window
//!
//! A pair matching both is reported once, as a source conflict. Flags never
//! alter reconciliation; they only annotate the timeline.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use wd_core::{InstanceId, InstanceStatus, SignalSource};

/// One status proposal as seen by the reconciler
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub from: InstanceStatus,
    pub to: InstanceStatus,
    pub source: SignalSource,
    pub reason: String,
    /// Unix milliseconds
    pub timestamp: u64,
    /// Whether the reconciler applied it
    pub accepted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Oscillation,
    SourceConflict,
}

/// A flagged pair of timeline entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictFlag {
    pub kind: ConflictKind,
    pub first: Transition,
    pub second: Transition,
    pub gap_ms: u64,
}

impl ConflictFlag {
    pub fn describe(&self) -> String {
        match self.kind {
            ConflictKind::SourceConflict => format!(
                "{} said {} ({}) but {} said {} ({}) {}ms later",
                self.first.source,
                self.first.to,
                self.first.reason,
                self.second.source,
                self.second.to,
                self.second.reason,
                self.gap_ms
            ),
            ConflictKind::Oscillation => format!(
                "{} -> {} reversed after {}ms ({}: {})",
                self.first.from, self.first.to, self.gap_ms, self.second.source, self.second.reason
            ),
        }
    }
}

/// Ordered conflict report for one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub instance_id: InstanceId,
    pub transitions: Vec<Transition>,
    pub flags: Vec<ConflictFlag>,
    pub count: usize,
}

/// Detection windows
#[derive(Debug, Clone, Copy)]
pub struct ConflictWindows {
    pub oscillation: Duration,
    pub source_conflict: Duration,
}

impl Default for ConflictWindows {
    fn default() -> Self {
        Self {
            oscillation: Duration::from_millis(5000),
            source_conflict: Duration::from_millis(2000),
        }
    }
}

/// Flag conflicts between consecutive transitions
pub fn analyze(transitions: &[Transition], windows: ConflictWindows) -> Vec<ConflictFlag> {
    let oscillation = windows.oscillation.as_millis() as u64;
    let source_conflict = windows.source_conflict.as_millis() as u64;

    transitions
        .windows(2)
        .filter_map(|pair| {
            let (first, second) = (&pair[0], &pair[1]);
            let gap_ms = second.timestamp.saturating_sub(first.timestamp);

            let kind = if first.source != second.source
                && first.to != second.to
                && gap_ms < source_conflict
            {
                ConflictKind::SourceConflict
            } else if second.from == first.to && second.to == first.from && gap_ms < oscillation {
                ConflictKind::Oscillation
            } else {
                return None;
            };

            Some(ConflictFlag {
                kind,
                first: first.clone(),
                second: second.clone(),
                gap_ms,
            })
        })
        .collect()
}

/// Bounded per-instance transition timelines
pub struct ConflictAnalyzer {
    capacity: usize,
    windows: ConflictWindows,
    timelines: Mutex<HashMap<InstanceId, VecDeque<Transition>>>,
}

impl ConflictAnalyzer {
    pub fn new(capacity: usize, windows: ConflictWindows) -> Self {
        Self {
            capacity: capacity.max(2),
            windows,
            timelines: Mutex::new(HashMap::new()),
        }
    }

    /// Append a transition, returning any flag it raises against its predecessor
    pub fn record(&self, id: &InstanceId, transition: Transition) -> Option<ConflictFlag> {
        let mut timelines = self.timelines.lock().unwrap_or_else(|e| e.into_inner());
        let timeline = timelines.entry(id.clone()).or_default();

        let flag = timeline.back().and_then(|prev| {
            analyze(&[prev.clone(), transition.clone()], self.windows)
                .into_iter()
                .next()
        });
        if let Some(flag) = &flag {
            tracing::warn!("Status conflict on {}: {}", id, flag.describe());
        }

        timeline.push_back(transition);
        while timeline.len() > self.capacity {
            timeline.pop_front();
        }
        flag
    }

    pub fn report(&self, id: &InstanceId) -> ConflictReport {
        let transitions: Vec<Transition> = self
            .timelines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        let flags = analyze(&transitions, self.windows);

        ConflictReport {
            instance_id: id.clone(),
            count: flags.len(),
            transitions,
            flags,
        }
    }

    pub fn forget(&self, id: &InstanceId) {
        self.timelines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    fn transition(
        source: SignalSource,
        from: InstanceStatus,
        to: InstanceStatus,
        timestamp: u64,
    ) -> Transition {
        Transition {
            from,
            to,
            source,
            reason: "test".to_string(),
            timestamp,
            accepted: true,
        }
    }

    #[test]
    fn test_disagreeing_sources_flag_one_source_conflict() {
        let timeline = [
            transition(SignalSource::Hook, InstanceStatus::Idle, InstanceStatus::Working, T0),
            transition(
                SignalSource::LocalPoll,
                InstanceStatus::Working,
                InstanceStatus::Idle,
                T0 + 1000,
            ),
        ];

        let flags = analyze(&timeline, ConflictWindows::default());
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].kind, ConflictKind::SourceConflict);
        assert_eq!(flags[0].gap_ms, 1000);
    }

    #[test]
    fn test_slow_reversal_is_not_flagged() {
        let timeline = [
            transition(SignalSource::Hook, InstanceStatus::Idle, InstanceStatus::Working, T0),
            transition(
                SignalSource::Hook,
                InstanceStatus::Working,
                InstanceStatus::Idle,
                T0 + 6000,
            ),
        ];

        assert!(analyze(&timeline, ConflictWindows::default()).is_empty());
    }

    #[test]
    fn test_fast_reversal_from_one_source_is_oscillation() {
        let timeline = [
            transition(SignalSource::Hook, InstanceStatus::Idle, InstanceStatus::Working, T0),
            transition(
                SignalSource::Hook,
                InstanceStatus::Working,
                InstanceStatus::Idle,
                T0 + 3000,
            ),
        ];

        let flags = analyze(&timeline, ConflictWindows::default());
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].kind, ConflictKind::Oscillation);
    }

    #[test]
    fn test_agreeing_sources_are_not_flagged() {
        let timeline = [
            transition(SignalSource::Hook, InstanceStatus::Idle, InstanceStatus::Working, T0),
            transition(
                SignalSource::LocalPoll,
                InstanceStatus::Working,
                InstanceStatus::Working,
                T0 + 500,
            ),
        ];

        assert!(analyze(&timeline, ConflictWindows::default()).is_empty());
    }

    #[test]
    fn test_report_is_bounded_and_counts_flags() {
        let analyzer = ConflictAnalyzer::new(3, ConflictWindows::default());
        let id = InstanceId::new("i1");

        let mut at = T0;
        for _ in 0..3 {
            analyzer.record(
                &id,
                transition(SignalSource::Hook, InstanceStatus::Idle, InstanceStatus::Working, at),
            );
            at += 1000;
            analyzer.record(
                &id,
                transition(SignalSource::Hook, InstanceStatus::Working, InstanceStatus::Idle, at),
            );
            at += 10_000;
        }

        let report = analyzer.report(&id);
        assert_eq!(report.transitions.len(), 3);
        assert_eq!(report.count, report.flags.len());
        assert_eq!(report.count, 1);
        assert!(report.flags[0].describe().contains("reversed"));

        analyzer.forget(&id);
        assert!(analyzer.report(&id).transitions.is_empty());
    }
}
