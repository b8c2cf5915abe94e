//! Reverse tunnel manager
//!
//! One tunnel per remote machine, shared by every instance on it.
//! Each tunnel owns a cancellable health loop and, while broken, at most one
//! reconnection task. All tunnel state transitions are published on a
//! broadcast channel; tunnel errors reach observers only that way.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use wd_core::config::TunnelConfig;
use wd_core::protocol::{TunnelStateChange, TunnelStatus};
use wd_core::{InstanceId, MachineId, TunnelError};

use crate::backoff::ExponentialBackoff;
use crate::health::HealthTracker;
use crate::link::{TunnelConnector, TunnelLink};

const EVENT_CAPACITY: usize = 256;

/// Result of [`TunnelManager::create_tunnel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelHandle {
    /// The instance joined an existing machine tunnel
    pub shared: bool,
}

struct LinkSlot {
    link: Arc<dyn TunnelLink>,
    generation: u64,
}

struct TunnelState {
    tracker: HealthTracker,
    dependents: BTreeSet<InstanceId>,
    link: Option<LinkSlot>,
    next_generation: u64,
}

impl TunnelState {
    /// Install a new link and return its generation
    fn install(&mut self, link: Arc<dyn TunnelLink>) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.link = Some(LinkSlot { link, generation });
        generation
    }

    /// Remove the current link so its close notification is ignored
    fn take_link(&mut self) -> Option<Arc<dyn TunnelLink>> {
        self.next_generation += 1;
        self.link.take().map(|slot| slot.link)
    }
}

struct MachineTunnel {
    machine_id: MachineId,
    state: Mutex<TunnelState>,
    reconnecting: AtomicBool,
    cancel: CancellationToken,
}

impl MachineTunnel {
    fn lock(&self) -> std::sync::MutexGuard<'_, TunnelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Inner {
    connector: Arc<dyn TunnelConnector>,
    config: TunnelConfig,
    tunnels: DashMap<MachineId, Arc<MachineTunnel>>,
    instances: DashMap<InstanceId, MachineId>,
    gates: DashMap<MachineId, Arc<tokio::sync::Mutex<()>>>,
    events: broadcast::Sender<TunnelStateChange>,
    shutdown: CancellationToken,
}

/// Owns every machine tunnel
#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<Inner>,
}

impl TunnelManager {
    pub fn new(connector: Arc<dyn TunnelConnector>, config: TunnelConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                tunnels: DashMap::new(),
                instances: DashMap::new(),
                gates: DashMap::new(),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Subscribe to tunnel state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelStateChange> {
        self.inner.events.subscribe()
    }

    fn emit(&self, change: Option<TunnelStateChange>) {
        if let Some(change) = change {
            tracing::info!(
                "Tunnel {}: {} -> {}{}",
                change.machine_id,
                change.previous_state,
                change.new_state,
                change
                    .error
                    .as_deref()
                    .map(|e| format!(" ({})", e))
                    .unwrap_or_default()
            );
            let _ = self.inner.events.send(change);
        }
    }

    /// Per-machine gate serialising open, join and close
    fn gate(&self, machine_id: &MachineId) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .gates
            .entry(machine_id.clone())
            .or_default()
            .clone()
    }

    /// Drop a machine's gate once it has no tunnel and nobody waits on it
    fn release_gate(&self, machine_id: &MachineId) {
        let tunnels = &self.inner.tunnels;
        self.inner.gates.remove_if(machine_id, |_, gate| {
            Arc::strong_count(gate) == 1 && !tunnels.contains_key(machine_id)
        });
    }

    fn tunnel(&self, machine_id: &MachineId) -> Option<Arc<MachineTunnel>> {
        self.inner.tunnels.get(machine_id).map(|t| Arc::clone(t.value()))
    }

    /// Ensure `machine_id` has a tunnel and register `instance_id` as a dependent.
    ///
    /// The first dependent opens the SSH connection; later ones share it.
    pub async fn create_tunnel(
        &self,
        instance_id: &InstanceId,
        machine_id: &MachineId,
    ) -> Result<TunnelHandle, TunnelError> {
        let result = {
            let gate = self.gate(machine_id);
            let _guard = gate.lock().await;
            self.create_locked(instance_id, machine_id).await
        };
        if result.is_err() {
            self.release_gate(machine_id);
        }
        result
    }

    async fn create_locked(
        &self,
        instance_id: &InstanceId,
        machine_id: &MachineId,
    ) -> Result<TunnelHandle, TunnelError> {
        if let Some(tunnel) = self.tunnel(machine_id) {
            tunnel.lock().dependents.insert(instance_id.clone());
            self.inner
                .instances
                .insert(instance_id.clone(), machine_id.clone());
            tracing::debug!("Instance {} joined tunnel to {}", instance_id, machine_id);
            return Ok(TunnelHandle { shared: true });
        }

        let config = &self.inner.config;
        tracing::info!(
            "Opening tunnel to {} (remote {} -> local {})",
            machine_id,
            config.remote_port,
            config.local_port
        );
        let link = self
            .inner
            .connector
            .connect(machine_id, config.remote_port, config.local_port)
            .await?;

        let mut state = TunnelState {
            tracker: HealthTracker::established(machine_id.clone()),
            dependents: BTreeSet::from([instance_id.clone()]),
            link: None,
            next_generation: 0,
        };
        let generation = state.install(link.clone());

        let tunnel = Arc::new(MachineTunnel {
            machine_id: machine_id.clone(),
            state: Mutex::new(state),
            reconnecting: AtomicBool::new(false),
            cancel: self.inner.shutdown.child_token(),
        });
        self.inner.tunnels.insert(machine_id.clone(), tunnel.clone());
        self.inner
            .instances
            .insert(instance_id.clone(), machine_id.clone());

        self.watch_link(&tunnel, link, generation);
        self.spawn_health_loop(&tunnel);

        Ok(TunnelHandle { shared: false })
    }

    /// Remove an instance from its machine's dependents, closing the tunnel
    /// when none remain. Returns `false` if the instance had no tunnel.
    pub async fn close_tunnel(&self, instance_id: &InstanceId) -> bool {
        let Some(machine_id) = self.machine_for(instance_id) else {
            return false;
        };

        let closed = {
            let gate = self.gate(&machine_id);
            let _guard = gate.lock().await;

            // Joins are serialised by the gate, so the count cannot grow
            // between this check and the teardown
            if self
                .inner
                .instances
                .remove_if(instance_id, |_, m| *m == machine_id)
                .is_none()
            {
                None
            } else if let Some(tunnel) = self.tunnel(&machine_id) {
                let remaining = {
                    let mut state = tunnel.lock();
                    state.dependents.remove(instance_id);
                    state.dependents.len()
                };
                tracing::debug!(
                    "Instance {} left tunnel to {} ({} remaining)",
                    instance_id,
                    machine_id,
                    remaining
                );
                if remaining == 0 {
                    self.teardown_locked(&machine_id).await;
                }
                Some(true)
            } else {
                Some(false)
            }
        };
        self.release_gate(&machine_id);
        closed.unwrap_or(false)
    }

    /// Close a machine's tunnel regardless of dependents
    pub async fn close_machine_tunnel(&self, machine_id: &MachineId) -> bool {
        let closed = {
            let gate = self.gate(machine_id);
            let _guard = gate.lock().await;
            self.teardown_locked(machine_id).await
        };
        self.release_gate(machine_id);
        closed
    }

    /// Tear a tunnel down if it still has no dependents
    async fn close_if_unused(&self, machine_id: &MachineId) {
        {
            let gate = self.gate(machine_id);
            let _guard = gate.lock().await;
            let unused = match self.tunnel(machine_id) {
                Some(tunnel) => {
                    let state = tunnel.lock();
                    state.dependents.is_empty()
                }
                None => false,
            };
            if unused {
                self.teardown_locked(machine_id).await;
            }
        }
        self.release_gate(machine_id);
    }

    /// Remove and close a tunnel; the caller holds the machine's gate
    async fn teardown_locked(&self, machine_id: &MachineId) -> bool {
        let Some((_, tunnel)) = self.inner.tunnels.remove(machine_id) else {
            return false;
        };
        tunnel.cancel.cancel();

        let (dependents, link) = {
            let mut state = tunnel.lock();
            (std::mem::take(&mut state.dependents), state.take_link())
        };
        for instance in dependents {
            self.inner
                .instances
                .remove_if(&instance, |_, m| m == machine_id);
        }
        if let Some(link) = link {
            link.close().await;
        }

        tracing::info!("Closed tunnel to {}", machine_id);
        true
    }

    pub fn get_status(&self, machine_id: &MachineId) -> Option<TunnelStatus> {
        let tunnel = self.tunnel(machine_id)?;
        let state = tunnel.lock();
        Some(state.tracker.status(
            self.inner.config.remote_port,
            self.inner.config.local_port,
            state.dependents.len(),
        ))
    }

    pub fn get_all_statuses(&self) -> Vec<TunnelStatus> {
        let mut machines: Vec<_> = self.inner.tunnels.iter().map(|t| t.key().clone()).collect();
        machines.sort();
        machines
            .iter()
            .filter_map(|m| self.get_status(m))
            .collect()
    }

    /// Machine an instance's tunnel belongs to
    pub fn machine_for(&self, instance_id: &InstanceId) -> Option<MachineId> {
        self.inner.instances.get(instance_id).map(|m| m.clone())
    }

    /// Reset the attempt counter and reconnect now.
    pub async fn force_reconnect(&self, machine_id: &MachineId) -> Result<(), TunnelError> {
        let tunnel = self
            .tunnel(machine_id)
            .ok_or_else(|| TunnelError::NotFound(machine_id.to_string()))?;

        let (old_link, change) = {
            let mut state = tunnel.lock();
            state.tracker.reset_attempts();
            let link = state.take_link();
            let change = state.tracker.connection_lost("reconnect requested");
            (link, change)
        };
        self.emit(change);
        if let Some(link) = old_link {
            link.close().await;
        }

        tracing::info!("Forced reconnect of tunnel to {}", machine_id);
        self.trigger_reconnect(&tunnel);
        Ok(())
    }

    /// Probe one machine's tunnel now.
    ///
    /// The periodic health loop calls this on every tick.
    pub async fn run_health_check(&self, machine_id: &MachineId) {
        let Some(tunnel) = self.tunnel(machine_id) else {
            return;
        };

        let link = {
            let state = tunnel.lock();
            if !state.tracker.should_probe() {
                return;
            }
            match &state.link {
                Some(slot) => slot.link.clone(),
                None => return,
            }
        };

        let timeout = self.inner.config.probe_timeout;
        let result = match tokio::time::timeout(timeout, link.probe(timeout)).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::TransientProbeFailure(format!(
                "probe timed out after {:?}",
                timeout
            ))),
        };

        match result {
            Ok(()) => {
                let change = tunnel.lock().tracker.probe_succeeded();
                self.emit(change);
            }
            Err(e) => {
                tracing::warn!("Health probe to {} failed: {}", machine_id, e);
                let (change, reconnect, stale) = {
                    let mut state = tunnel.lock();
                    let (change, reconnect) = state.tracker.probe_failed(&e);
                    let stale = if reconnect { state.take_link() } else { None };
                    (change, reconnect, stale)
                };
                self.emit(change);
                if let Some(link) = stale {
                    tokio::spawn(async move { link.close().await });
                }
                if reconnect {
                    self.trigger_reconnect(&tunnel);
                }
            }
        }
    }

    fn spawn_health_loop(&self, tunnel: &Arc<MachineTunnel>) {
        let manager = self.clone();
        let machine_id = tunnel.machine_id.clone();
        let cancel = tunnel.cancel.clone();
        let interval = self.inner.config.health_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                manager.run_health_check(&machine_id).await;
            }
            tracing::debug!("Health loop for {} stopped", machine_id);
        });
    }

    /// React when the connection behind `generation` closes
    fn watch_link(&self, tunnel: &Arc<MachineTunnel>, link: Arc<dyn TunnelLink>, generation: u64) {
        let manager = self.clone();
        let tunnel = tunnel.clone();
        let closed = link.closed();

        tokio::spawn(async move {
            tokio::select! {
                _ = tunnel.cancel.cancelled() => {}
                _ = closed.cancelled() => manager.connection_lost(&tunnel, generation).await,
            }
        });
    }

    async fn connection_lost(&self, tunnel: &Arc<MachineTunnel>, generation: u64) {
        let (change, has_dependents) = {
            let mut state = tunnel.lock();
            if state.link.as_ref().map(|slot| slot.generation) != Some(generation) {
                return;
            }
            state.take_link();
            let change = state.tracker.connection_lost("connection closed");
            (change, !state.dependents.is_empty())
        };
        self.emit(change);

        if has_dependents {
            self.trigger_reconnect(tunnel);
        } else {
            self.close_if_unused(&tunnel.machine_id).await;
        }
    }

    /// Start reconnection unless one is already in flight for the machine
    fn trigger_reconnect(&self, tunnel: &Arc<MachineTunnel>) {
        if tunnel.reconnecting.swap(true, Ordering::SeqCst) {
            tracing::debug!("Reconnect to {} already in progress", tunnel.machine_id);
            return;
        }

        let manager = self.clone();
        let tunnel = tunnel.clone();
        tokio::spawn(async move {
            manager.reconnect_loop(&tunnel).await;
            tunnel.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn reconnect_loop(&self, tunnel: &Arc<MachineTunnel>) {
        let config = &self.inner.config;
        let machine_id = &tunnel.machine_id;
        let mut backoff = ExponentialBackoff::from_config(&config.backoff);

        loop {
            if tunnel.cancel.is_cancelled() {
                return;
            }

            let change = {
                let mut state = tunnel.lock();
                if state.tracker.reconnect_attempts() >= config.max_reconnect_attempts {
                    let change = state.tracker.give_up();
                    drop(state);
                    tracing::error!(
                        "Giving up on tunnel to {} after {} attempts",
                        machine_id,
                        config.max_reconnect_attempts
                    );
                    self.emit(change);
                    return;
                }
                state.tracker.begin_reconnect()
            };
            self.emit(change);

            let delay = backoff.next_delay();
            tokio::select! {
                _ = tunnel.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self
                .inner
                .connector
                .connect(machine_id, config.remote_port, config.local_port)
                .await
            {
                Ok(link) => {
                    if tunnel.cancel.is_cancelled() {
                        link.close().await;
                        return;
                    }
                    let (generation, change) = {
                        let mut state = tunnel.lock();
                        let generation = state.install(link.clone());
                        (generation, state.tracker.reconnected())
                    };
                    self.emit(change);
                    self.watch_link(tunnel, link, generation);
                    return;
                }
                Err(e) => {
                    tracing::warn!("Reconnect to {} failed: {}", machine_id, e);
                    let change = tunnel.lock().tracker.reconnect_failed(&e);
                    self.emit(change);
                }
            }
        }
    }

    /// Close every tunnel
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let machines: Vec<_> = self.inner.tunnels.iter().map(|t| t.key().clone()).collect();
        for machine_id in machines {
            self.close_machine_tunnel(&machine_id).await;
        }
    }
}
