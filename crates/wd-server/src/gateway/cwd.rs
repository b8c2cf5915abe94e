//! Shared working-directory polling
//!
//! A single loop probes every subscribed instance for its live working
//! directory. It runs only while at least one instance has a subscriber.
//! Changes are broadcast immediately and persisted after a debounce window
//! so a burst of `cd`s costs one store write.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use wd_core::store::InstanceStore;
use wd_core::InstanceId;

use super::Gateway;

/// Start/stop control for the poll loop
#[derive(Default)]
pub(super) struct CwdPoller {
    running: Mutex<Option<CancellationToken>>,
    ticks: Arc<AtomicU64>,
}

impl CwdPoller {
    /// Start the loop unless it is already running
    pub(super) fn start(&self, gateway: Gateway, interval: Duration) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        *running = Some(cancel.clone());
        let ticks = self.ticks.clone();
        tracing::debug!("Starting cwd poll every {:?}", interval);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of an interval completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                ticks.fetch_add(1, Ordering::Relaxed);
                gateway.poll_cwd_once().await;
            }
            tracing::debug!("Cwd poll stopped");
        });
    }

    pub(super) fn stop(&self) {
        if let Some(cancel) = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            cancel.cancel();
        }
    }

    pub(super) fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub(super) fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

/// Persists working directories after a quiet period.
///
/// Each schedule supersedes any pending write for the same instance.
#[derive(Clone)]
pub struct DebouncedWriter {
    store: Arc<dyn InstanceStore>,
    debounce: Duration,
    pending: Arc<Mutex<HashMap<InstanceId, u64>>>,
    sequence: Arc<AtomicU64>,
}

impl DebouncedWriter {
    pub fn new(store: Arc<dyn InstanceStore>, debounce: Duration) -> Self {
        Self {
            store,
            debounce,
            pending: Arc::new(Mutex::new(HashMap::new())),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn schedule(&self, id: InstanceId, dir: PathBuf) {
        let ticket = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), ticket);

        let writer = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(writer.debounce).await;

            let current = {
                let mut pending = writer.pending.lock().unwrap_or_else(|e| e.into_inner());
                if pending.get(&id) == Some(&ticket) {
                    pending.remove(&id);
                    true
                } else {
                    false
                }
            };
            if !current {
                return;
            }

            tracing::debug!("Persisting cwd {} for {}", dir.display(), id);
            if let Err(e) = writer.store.set_working_dir(&id, dir).await {
                tracing::warn!("Failed to persist cwd for {}: {}", id, e);
            }
        });
    }

    /// Drop a pending write
    pub fn cancel(&self, id: &InstanceId) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}
