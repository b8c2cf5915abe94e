//! Authoritative instance status
//!
//! Three kinds of signal compete for an instance's status: hooks pushed by
//! the agent process, output activity observed on its terminal, and an
//! inactivity timeout. Hooks are trusted immediately. Activity is weighed
//! against recent hooks according to the configured [`ActivityPolicy`]. The
//! sweeper demotes `working` to `idle` once nothing has been heard for the
//! inactivity timeout.
//!
//! Each instance has its own async cell; a change is persisted, appended to
//! the event record and broadcast while the cell is held, so every instance
//! has a single ordered sequence of transitions.

use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use wd_core::config::{ActivityPolicy, StatusConfig};
use wd_core::protocol::StatusChange;
use wd_core::store::{InstanceStore, StatusEvent};
use wd_core::time::current_time_millis;
use wd_core::{InstanceId, InstanceStatus, SignalSource, StoreError};

use super::conflict::{ConflictAnalyzer, ConflictReport, ConflictWindows, Transition};

const CHANGE_CAPACITY: usize = 256;

/// A hook notification mapped onto a status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSignal {
    pub status: InstanceStatus,
    /// Name the hook arrived with
    pub name: String,
}

impl HookSignal {
    pub fn new(status: InstanceStatus) -> Self {
        Self {
            status,
            name: status.as_str().to_string(),
        }
    }
}

impl FromStr for HookSignal {
    type Err = String;

    /// Accepts agent hook event names as well as plain status names
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "UserPromptSubmit" | "PreToolUse" | "PostToolUse" | "SubagentStart" => {
                InstanceStatus::Working
            }
            "Stop" | "SubagentStop" | "Notification" | "SessionStart" => InstanceStatus::Idle,
            "SessionEnd" => InstanceStatus::Disconnected,
            other => other.parse::<InstanceStatus>()?,
        };
        Ok(Self {
            status,
            name: s.to_string(),
        })
    }
}

/// Result of a hook signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookOutcome {
    pub previous: InstanceStatus,
    pub status: InstanceStatus,
    pub changed: bool,
}

struct Cell {
    status: InstanceStatus,
    last_hook: Option<Instant>,
    last_activity: Option<Instant>,
    last_change: Instant,
    /// Last proposal that was turned down, to avoid re-recording it per chunk
    last_rejected: Option<(SignalSource, InstanceStatus)>,
}

impl Cell {
    fn new(status: InstanceStatus) -> Self {
        Self {
            status,
            last_hook: None,
            last_activity: None,
            last_change: Instant::now(),
            last_rejected: None,
        }
    }

    /// Most recent sign of life
    fn last_heard(&self) -> Instant {
        [self.last_hook, self.last_activity]
            .into_iter()
            .flatten()
            .fold(self.last_change, Instant::max)
    }
}

type CellRef = Arc<tokio::sync::Mutex<Cell>>;

/// Merges status signals into one status per instance
pub struct StatusReconciler {
    store: Arc<dyn InstanceStore>,
    config: StatusConfig,
    cells: DashMap<InstanceId, CellRef>,
    analyzer: ConflictAnalyzer,
    changes: broadcast::Sender<StatusChange>,
}

impl StatusReconciler {
    pub fn new(store: Arc<dyn InstanceStore>, config: StatusConfig) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let analyzer = ConflictAnalyzer::new(
            config.timeline_capacity,
            ConflictWindows {
                oscillation: config.oscillation_window,
                source_conflict: config.source_conflict_window,
            },
        );
        Self {
            store,
            config,
            cells: DashMap::new(),
            analyzer,
            changes,
        }
    }

    /// Accepted changes, in acceptance order per instance
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.changes.subscribe()
    }

    async fn cell(&self, id: &InstanceId) -> Result<CellRef, StoreError> {
        if let Some(cell) = self.cells.get(id) {
            return Ok(cell.clone());
        }
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        Ok(self
            .cells
            .entry(id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Cell::new(record.status))))
            .clone())
    }

    /// Current authoritative status
    pub async fn current(&self, id: &InstanceId) -> Option<InstanceStatus> {
        let cell = self.cell(id).await.ok()?;
        let status = cell.lock().await.status;
        Some(status)
    }

    /// Apply a hook signal; hooks are trusted immediately
    pub async fn handle_hook(
        &self,
        id: &InstanceId,
        signal: HookSignal,
    ) -> Result<HookOutcome, StoreError> {
        let cell = self.cell(id).await?;
        let mut cell = cell.lock().await;
        cell.last_hook = Some(Instant::now());

        let previous = cell.status;
        let reason = format!("hook {}", signal.name);
        let changed = self
            .apply(id, &mut cell, signal.status, SignalSource::Hook, reason)
            .await;

        Ok(HookOutcome {
            previous,
            status: cell.status,
            changed,
        })
    }

    /// Terminal output was observed on the instance's session
    pub async fn record_activity(&self, id: &InstanceId, source: SignalSource) {
        let Ok(cell) = self.cell(id).await else {
            tracing::trace!("Activity for unknown instance {}", id);
            return;
        };
        let mut cell = cell.lock().await;
        let now = Instant::now();
        cell.last_activity = Some(now);

        if cell.status == InstanceStatus::Working {
            return;
        }

        let hook_recent = cell
            .last_hook
            .is_some_and(|at| now.duration_since(at) < self.config.hook_quiet_window);
        if self.config.activity_policy == ActivityPolicy::HookPriority && hook_recent {
            let proposal = (source, InstanceStatus::Working);
            if cell.last_rejected != Some(proposal) {
                cell.last_rejected = Some(proposal);
                self.analyzer.record(
                    id,
                    Transition {
                        from: cell.status,
                        to: InstanceStatus::Working,
                        source,
                        reason: "terminal output while hook is recent".to_string(),
                        timestamp: current_time_millis(),
                        accepted: false,
                    },
                );
            }
            return;
        }

        self.apply(
            id,
            &mut cell,
            InstanceStatus::Working,
            source,
            "terminal output".to_string(),
        )
        .await;
    }

    /// The instance's session ended
    pub async fn mark_exited(&self, id: &InstanceId, code: Option<i32>, source: SignalSource) {
        let Ok(cell) = self.cell(id).await else {
            return;
        };
        let mut cell = cell.lock().await;
        let (status, reason) = match code {
            Some(code) if code != 0 => (InstanceStatus::Error, format!("exited with code {}", code)),
            Some(_) => (InstanceStatus::Disconnected, "exited".to_string()),
            None => (InstanceStatus::Disconnected, "session closed".to_string()),
        };
        self.apply(id, &mut cell, status, source, reason).await;
    }

    /// Demote instances that have been silent past the inactivity timeout
    pub async fn sweep(&self) {
        let cells: Vec<(InstanceId, CellRef)> = self
            .cells
            .iter()
            .map(|c| (c.key().clone(), c.value().clone()))
            .collect();

        for (id, cell) in cells {
            let mut cell = cell.lock().await;
            if cell.status != InstanceStatus::Working {
                continue;
            }
            let silent = cell.last_heard().elapsed();
            if silent >= self.config.inactivity_timeout {
                let reason = format!("no activity for {}s", silent.as_secs());
                self.apply(&id, &mut cell, InstanceStatus::Idle, SignalSource::Timeout, reason)
                    .await;
            }
        }
    }

    /// Run [`Self::sweep`] on the configured interval until cancelled
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let reconciler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reconciler.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => reconciler.sweep().await,
                }
            }
        })
    }

    pub fn conflicts(&self, id: &InstanceId) -> ConflictReport {
        self.analyzer.report(id)
    }

    /// Drop all state for a deleted instance
    pub fn forget(&self, id: &InstanceId) {
        self.cells.remove(id);
        self.analyzer.forget(id);
    }

    /// Returns whether the status changed
    async fn apply(
        &self,
        id: &InstanceId,
        cell: &mut Cell,
        status: InstanceStatus,
        source: SignalSource,
        reason: String,
    ) -> bool {
        let previous = cell.status;
        if previous == status {
            return false;
        }

        let timestamp = current_time_millis();
        cell.status = status;
        cell.last_change = Instant::now();
        cell.last_rejected = None;

        self.analyzer.record(
            id,
            Transition {
                from: previous,
                to: status,
                source,
                reason: reason.clone(),
                timestamp,
                accepted: true,
            },
        );

        tracing::info!("Instance {}: {} -> {} ({}: {})", id, previous, status, source, reason);

        if let Err(e) = self.store.set_status(id, status).await {
            tracing::warn!("Failed to persist status of {}: {}", id, e);
        }
        let event = StatusEvent {
            instance_id: id.clone(),
            previous,
            status,
            source,
            reason: reason.clone(),
            timestamp,
        };
        if let Err(e) = self.store.append_event(event).await {
            tracing::warn!("Failed to record status event for {}: {}", id, e);
        }

        let _ = self.changes.send(StatusChange {
            instance_id: id.clone(),
            previous,
            status,
            source,
            reason,
            timestamp,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wd_core::store::{InstanceRecord, MemoryStore};
    use wd_core::MachineRef;

    async fn setup(config: StatusConfig) -> (Arc<StatusReconciler>, Arc<MemoryStore>, InstanceId) {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert(InstanceRecord::new("i1", "/work", MachineRef::Local))
            .await
            .unwrap();
        let reconciler = Arc::new(StatusReconciler::new(store.clone(), config));
        (reconciler, store, InstanceId::new("i1"))
    }

    #[test]
    fn test_hook_signal_parsing() {
        assert_eq!(
            "PreToolUse".parse::<HookSignal>().unwrap().status,
            InstanceStatus::Working
        );
        assert_eq!("Stop".parse::<HookSignal>().unwrap().status, InstanceStatus::Idle);
        assert_eq!(
            "SessionEnd".parse::<HookSignal>().unwrap().status,
            InstanceStatus::Disconnected
        );
        assert_eq!("error".parse::<HookSignal>().unwrap().status, InstanceStatus::Error);
        assert!("Sleeping".parse::<HookSignal>().is_err());
    }

    #[tokio::test]
    async fn test_hook_is_applied_persisted_and_broadcast() {
        let (reconciler, store, id) = setup(StatusConfig::default()).await;
        let mut changes = reconciler.subscribe();

        let outcome = reconciler
            .handle_hook(&id, "UserPromptSubmit".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            HookOutcome {
                previous: InstanceStatus::Idle,
                status: InstanceStatus::Working,
                changed: true
            }
        );

        let change = changes.recv().await.unwrap();
        assert_eq!(change.source, SignalSource::Hook);
        assert_eq!(change.status, InstanceStatus::Working);

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Working);
        assert_eq!(store.events(&id).await.unwrap().len(), 1);

        let repeat = reconciler
            .handle_hook(&id, HookSignal::new(InstanceStatus::Working))
            .await
            .unwrap();
        assert!(!repeat.changed);
        assert_eq!(store.events(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_hook_for_unknown_instance_fails() {
        let (reconciler, _, _) = setup(StatusConfig::default()).await;
        let result = reconciler
            .handle_hook(&InstanceId::new("ghost"), HookSignal::new(InstanceStatus::Idle))
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_yields_to_recent_hook() {
        let (reconciler, _, id) = setup(StatusConfig::default()).await;

        reconciler
            .handle_hook(&id, "Stop".parse().unwrap())
            .await
            .unwrap();
        reconciler.record_activity(&id, SignalSource::LocalPoll).await;
        reconciler.record_activity(&id, SignalSource::LocalPoll).await;
        assert_eq!(reconciler.current(&id).await, Some(InstanceStatus::Idle));

        let report = reconciler.conflicts(&id);
        assert_eq!(report.transitions.iter().filter(|t| !t.accepted).count(), 1);

        tokio::time::advance(Duration::from_secs(16)).await;
        reconciler.record_activity(&id, SignalSource::LocalPoll).await;
        assert_eq!(reconciler.current(&id).await, Some(InstanceStatus::Working));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_wins_policy_overrides_hook() {
        let config = StatusConfig {
            activity_policy: ActivityPolicy::ActivityWins,
            ..StatusConfig::default()
        };
        let (reconciler, _, id) = setup(config).await;

        reconciler
            .handle_hook(&id, "Stop".parse().unwrap())
            .await
            .unwrap();
        reconciler.record_activity(&id, SignalSource::RemotePoll).await;
        assert_eq!(reconciler.current(&id).await, Some(InstanceStatus::Working));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_demotes_only_after_silence() {
        let (reconciler, store, id) = setup(StatusConfig::default()).await;
        reconciler.record_activity(&id, SignalSource::LocalPoll).await;
        assert_eq!(reconciler.current(&id).await, Some(InstanceStatus::Working));

        tokio::time::advance(Duration::from_secs(20)).await;
        reconciler.record_activity(&id, SignalSource::LocalPoll).await;
        tokio::time::advance(Duration::from_secs(20)).await;
        reconciler.sweep().await;
        assert_eq!(reconciler.current(&id).await, Some(InstanceStatus::Working));

        tokio::time::advance(Duration::from_secs(15)).await;
        reconciler.sweep().await;
        assert_eq!(reconciler.current(&id).await, Some(InstanceStatus::Idle));

        let events = store.events(&id).await.unwrap();
        assert_eq!(events.last().unwrap().source, SignalSource::Timeout);
    }

    #[tokio::test]
    async fn test_exit_code_maps_to_status() {
        let (reconciler, _, id) = setup(StatusConfig::default()).await;

        reconciler.mark_exited(&id, Some(2), SignalSource::LocalPoll).await;
        assert_eq!(reconciler.current(&id).await, Some(InstanceStatus::Error));

        reconciler.mark_exited(&id, Some(0), SignalSource::LocalPoll).await;
        assert_eq!(
            reconciler.current(&id).await,
            Some(InstanceStatus::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_contradicting_sources_show_up_in_report() {
        let config = StatusConfig {
            activity_policy: ActivityPolicy::ActivityWins,
            ..StatusConfig::default()
        };
        let (reconciler, _, id) = setup(config).await;

        reconciler.record_activity(&id, SignalSource::LocalPoll).await;
        reconciler
            .handle_hook(&id, "Stop".parse().unwrap())
            .await
            .unwrap();

        let report = reconciler.conflicts(&id);
        assert_eq!(report.transitions.len(), 2);
        assert_eq!(report.count, 1);
    }
}
