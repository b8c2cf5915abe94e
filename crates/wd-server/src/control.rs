//! Control-plane facade
//!
//! Owns the terminal manager, the tunnel manager, the gateway and the status
//! reconciler, and wires their event streams together:
//!
//! - terminal activity feeds status reconciliation
//! - a session exit clears gateway subscriptions, drops the instance's
//!   tunnel dependency, maps the exit code onto a status and broadcasts
//!   `instance:closed`, unless a newer session already replaced the one
//!   that exited
//! - tunnel transitions and status changes are broadcast to every viewer

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use wd_core::config::ServerConfig;
use wd_core::protocol::ServerMessage;
use wd_core::store::{InstanceRecord, InstanceStore};
use wd_core::{
    InstanceId, MachineRef, SignalSource, StoreError, TerminalError, TerminalSize, WdError,
};
use wd_terminal::{BackendSpawner, SpawnConfig, TerminalEvent, TerminalManager};
use wd_tunnel::{TunnelConnector, TunnelManager};

use crate::gateway::Gateway;
use crate::status::{HookOutcome, HookSignal, StatusReconciler};

/// Request to create an instance
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstance {
    /// Generated when absent
    #[serde(default)]
    pub id: Option<InstanceId>,
    #[serde(default)]
    pub name: Option<String>,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub machine: MachineRef,
}

/// The assembled control plane
#[derive(Clone)]
pub struct ControlPlane {
    config: Arc<ServerConfig>,
    store: Arc<dyn InstanceStore>,
    terminals: TerminalManager,
    tunnels: TunnelManager,
    gateway: Gateway,
    status: Arc<StatusReconciler>,
    cancel: CancellationToken,
}

impl ControlPlane {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn InstanceStore>,
        spawner: Arc<dyn BackendSpawner>,
        connector: Arc<dyn TunnelConnector>,
    ) -> Self {
        let terminals = TerminalManager::new(spawner, config.history_capacity);
        let tunnels = TunnelManager::new(connector, config.tunnel.clone());
        let gateway = Gateway::new(
            terminals.clone(),
            tunnels.clone(),
            store.clone(),
            config.gateway.clone(),
        );
        let status = Arc::new(StatusReconciler::new(store.clone(), config.status.clone()));

        Self {
            config: Arc::new(config),
            store,
            terminals,
            tunnels,
            gateway,
            status,
            cancel: CancellationToken::new(),
        }
    }

    /// Start the event wiring and the inactivity sweeper
    pub fn start(&self) {
        let plane = self.clone();
        let mut events = self.terminals.subscribe_events();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = plane.cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(TerminalEvent::Activity {
                        instance_id,
                        source,
                    }) => plane.status.record_activity(&instance_id, source).await,
                    Ok(TerminalEvent::Exited {
                        instance_id,
                        generation,
                        code,
                    }) => plane.session_exited(&instance_id, generation, code).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Terminal event stream lagged by {}", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let gateway = self.gateway.clone();
        let mut tunnel_events = self.tunnels.subscribe();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = tunnel_events.recv() => event,
                };
                match event {
                    Ok(change) => gateway.broadcast_all(ServerMessage::TunnelState(change)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Tunnel event stream lagged by {}", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let gateway = self.gateway.clone();
        let mut changes = self.status.subscribe();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = changes.recv() => change,
                };
                match change {
                    Ok(change) => gateway.broadcast_all(ServerMessage::StatusChanged(change)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Status change stream lagged by {}", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.status.spawn_sweeper(self.cancel.child_token());
        tracing::info!("Control plane started");
    }

    async fn session_exited(&self, id: &InstanceId, generation: u64, code: Option<i32>) {
        // A viewer may have respawned the instance before this exit was handled
        if let Some(live) = self.terminals.generation(id) {
            if live > generation {
                tracing::debug!(
                    "Ignoring exit of {} generation {}; generation {} is live",
                    id,
                    generation,
                    live
                );
                return;
            }
        }

        tracing::info!("Session {} exited with {:?}", id, code);
        self.gateway.session_ended(id);

        let remote = match self.store.get(id).await {
            Ok(Some(record)) => record.machine.is_remote(),
            _ => self.tunnels.machine_for(id).is_some(),
        };
        self.tunnels.close_tunnel(id).await;

        let source = if remote {
            SignalSource::RemotePoll
        } else {
            SignalSource::LocalPoll
        };
        self.status.mark_exited(id, code, source).await;

        self.gateway.broadcast_all(ServerMessage::InstanceClosed {
            instance_id: id.clone(),
            code,
        });
    }

    /// Register an instance and start its session.
    ///
    /// Fails with `AlreadyExists` when the id has a live session or a stored
    /// record. Nothing is left behind when the tunnel or the spawn fails.
    pub async fn create_instance(&self, request: CreateInstance) -> Result<InstanceRecord, WdError> {
        let id = request
            .id
            .unwrap_or_else(|| InstanceId::new(uuid::Uuid::new_v4().to_string()));
        if self.terminals.has(&id) || self.store.get(&id).await?.is_some() {
            return Err(TerminalError::AlreadyExists(id).into());
        }

        let mut record = InstanceRecord::new(id.clone(), request.working_dir, request.machine);
        record.name = request.name;
        self.store.upsert(record.clone()).await?;

        if let Some(machine_id) = record.machine.machine_id() {
            if let Err(e) = self.tunnels.create_tunnel(&id, machine_id).await {
                self.store.remove(&id).await?;
                return Err(e.into());
            }
        }

        let config = SpawnConfig::for_machine(&record.machine, record.working_dir.clone());
        if let Err(e) = self
            .terminals
            .spawn(&id, config, TerminalSize::default())
            .await
        {
            tracing::warn!("Failed to start {}: {}", id, e);
            self.tunnels.close_tunnel(&id).await;
            self.store.remove(&id).await?;
            return Err(e.into());
        }

        tracing::info!("Created instance {} in {}", id, record.working_dir.display());
        Ok(record)
    }

    /// Kill the session, drop the tunnel dependency and delete the record.
    ///
    /// Returns `NotFound` when neither a session nor a record existed.
    pub async fn close_instance(&self, id: &InstanceId) -> Result<(), WdError> {
        let had_session = match self.terminals.kill(id).await {
            Ok(()) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => {
                tracing::warn!("Failed to kill {}: {}", id, e);
                true
            }
        };

        self.gateway.instance_removed(id);
        self.tunnels.close_tunnel(id).await;
        let record = self.store.remove(id).await?;
        self.status.forget(id);

        if !had_session {
            if record.is_none() {
                return Err(StoreError::NotFound(id.clone()).into());
            }
            // No exit event will follow, so announce the close here
            self.gateway.broadcast_all(ServerMessage::InstanceClosed {
                instance_id: id.clone(),
                code: None,
            });
        }
        tracing::info!("Closed instance {}", id);
        Ok(())
    }

    pub async fn handle_hook(
        &self,
        id: &InstanceId,
        signal: HookSignal,
    ) -> Result<HookOutcome, StoreError> {
        self.status.handle_hook(id, signal).await
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    pub fn terminals(&self) -> &TerminalManager {
        &self.terminals
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn status(&self) -> &Arc<StatusReconciler> {
        &self.status
    }

    /// Stop background tasks, sessions and tunnels
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down control plane");
        self.cancel.cancel();
        self.gateway.shutdown();
        self.terminals.shutdown().await;
        self.tunnels.shutdown().await;
    }
}
