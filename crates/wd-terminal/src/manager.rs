//! Terminal session manager
//!
//! Registry of live sessions keyed by instance id. Every session gets a pump
//! task that appends backend output to the session history, fans it out to
//! attached viewers and reports activity and exit on the manager event
//! channel.
//!
//! Spawns for one instance are serialised by a per-instance gate so the
//! "already live?" check and the spawn happen in one critical section, and a
//! kill issued during a spawn waits for it and then tears the new session
//! down.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};

use wd_core::time::current_time_millis;
use wd_core::{InstanceId, SignalSource, TerminalError, TerminalSize};

use crate::backend::{BackendEvent, BackendSpawner, SpawnConfig, TerminalBackend};
use crate::history::OutputHistory;

/// Buffered output chunks per attached viewer before it starts lagging
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// Buffered backend events before the backend reader is slowed down
const BACKEND_CHANNEL_CAPACITY: usize = 256;

/// Output delivered to viewers attached to one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    Data(Bytes),
    Exit(Option<i32>),
}

/// Manager-wide session events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    /// A session produced output
    Activity {
        instance_id: InstanceId,
        source: SignalSource,
    },
    /// A session ended; it is no longer registered.
    ///
    /// `generation` identifies the session that ended, so a consumer can
    /// tell a late exit apart from one belonging to a respawned session.
    Exited {
        instance_id: InstanceId,
        generation: u64,
        code: Option<i32>,
    },
}

/// History snapshot plus a live feed that continues exactly where it ends
pub struct Attachment {
    pub history: Vec<u8>,
    pub output: broadcast::Receiver<SessionOutput>,
}

/// Summary of a live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub instance_id: InstanceId,
    pub config: SpawnConfig,
    pub size: TerminalSize,
    pub pid: Option<u32>,
    pub history_len: usize,
    pub created_at: u64,
}

struct Session {
    generation: u64,
    config: SpawnConfig,
    backend: Box<dyn TerminalBackend>,
    size: Mutex<TerminalSize>,
    history: Mutex<OutputHistory>,
    output: broadcast::Sender<SessionOutput>,
    created_at: u64,
}

impl Session {
    /// Record a chunk and forward it to attached viewers.
    ///
    /// Both happen under the history lock so an attach sees either the chunk
    /// in its snapshot or on its receiver, never both or neither.
    fn record(&self, chunk: Bytes) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push(chunk.clone());
        let _ = self.output.send(SessionOutput::Data(chunk));
    }

    fn attach(&self) -> Attachment {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        Attachment {
            history: history.snapshot(),
            output: self.output.subscribe(),
        }
    }
}

/// Owns every live terminal session
#[derive(Clone)]
pub struct TerminalManager {
    spawner: Arc<dyn BackendSpawner>,
    sessions: Arc<DashMap<InstanceId, Arc<Session>>>,
    gates: Arc<DashMap<InstanceId, Arc<tokio::sync::Mutex<()>>>>,
    events: broadcast::Sender<TerminalEvent>,
    generation: Arc<AtomicU64>,
    history_capacity: usize,
}

impl TerminalManager {
    pub fn new(spawner: Arc<dyn BackendSpawner>, history_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        Self {
            spawner,
            sessions: Arc::new(DashMap::new()),
            gates: Arc::new(DashMap::new()),
            events,
            generation: Arc::new(AtomicU64::new(0)),
            history_capacity,
        }
    }

    /// Subscribe to activity and exit events for all sessions
    pub fn subscribe_events(&self) -> broadcast::Receiver<TerminalEvent> {
        self.events.subscribe()
    }

    fn gate(&self, id: &InstanceId) -> Arc<tokio::sync::Mutex<()>> {
        self.gates.entry(id.clone()).or_default().clone()
    }

    /// Drop the gate of an instance nobody is waiting on
    fn release_gate(&self, id: &InstanceId) {
        release_gate(&self.gates, id);
    }

    fn session(&self, id: &InstanceId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    /// Start a session, failing if one is already live.
    pub async fn spawn(
        &self,
        id: &InstanceId,
        config: SpawnConfig,
        size: TerminalSize,
    ) -> Result<(), TerminalError> {
        let result = {
            let gate = self.gate(id);
            let _guard = gate.lock().await;

            if self.sessions.contains_key(id) {
                return Err(TerminalError::AlreadyExists(id.clone()));
            }
            self.spawn_locked(id, config, size).await
        };
        if result.is_err() {
            self.release_gate(id);
        }
        result
    }

    /// Make sure a session is live, spawning it if needed.
    ///
    /// Returns `true` when a new session was started.
    pub async fn ensure(
        &self,
        id: &InstanceId,
        config: SpawnConfig,
        size: TerminalSize,
    ) -> Result<bool, TerminalError> {
        let result = {
            let gate = self.gate(id);
            let _guard = gate.lock().await;

            if self.sessions.contains_key(id) {
                return Ok(false);
            }
            tracing::info!("Respawning session for {}", id);
            self.spawn_locked(id, config, size).await
        };
        if result.is_err() {
            self.release_gate(id);
        }
        result.map(|()| true)
    }

    async fn spawn_locked(
        &self,
        id: &InstanceId,
        config: SpawnConfig,
        size: TerminalSize,
    ) -> Result<(), TerminalError> {
        let (tx, rx) = mpsc::channel(BACKEND_CHANNEL_CAPACITY);
        let backend = self.spawner.spawn(id, &config, size, tx).await?;

        let (output, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let session = Arc::new(Session {
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
            config,
            backend,
            size: Mutex::new(size),
            history: Mutex::new(OutputHistory::new(self.history_capacity)),
            output,
            created_at: current_time_millis(),
        });

        self.sessions.insert(id.clone(), session.clone());
        tracing::info!("Session {} started (pid {:?})", id, session.backend.pid());

        tokio::spawn(pump(
            id.clone(),
            session,
            rx,
            self.sessions.clone(),
            self.gates.clone(),
            self.events.clone(),
        ));
        Ok(())
    }

    /// Send bytes to a session
    pub async fn write(&self, id: &InstanceId, data: &[u8]) -> Result<(), TerminalError> {
        let session = self
            .session(id)
            .ok_or_else(|| TerminalError::NotFound(id.clone()))?;
        session.backend.write(data).await
    }

    /// Resize a session's terminal
    pub async fn resize(&self, id: &InstanceId, cols: u16, rows: u16) -> Result<(), TerminalError> {
        let session = self
            .session(id)
            .ok_or_else(|| TerminalError::NotFound(id.clone()))?;
        let size = TerminalSize::new(rows, cols);
        tracing::debug!("Resizing {} to {}x{}", id, cols, rows);
        session.backend.resize(size).await?;
        *session.size.lock().unwrap_or_else(|e| e.into_inner()) = size;
        Ok(())
    }

    /// Terminate a session.
    ///
    /// Waits for an in-flight spawn of the same instance so a close issued
    /// mid-respawn still ends with no live session.
    pub async fn kill(&self, id: &InstanceId) -> Result<(), TerminalError> {
        let removed = {
            let gate = self.gate(id);
            let _guard = gate.lock().await;
            self.sessions.remove(id)
        };
        self.release_gate(id);

        let (_, session) = removed.ok_or_else(|| TerminalError::NotFound(id.clone()))?;
        tracing::info!("Killing session {}", id);
        session.backend.kill().await
    }

    pub fn has(&self, id: &InstanceId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Generation of the live session, if any; higher means newer
    pub fn generation(&self, id: &InstanceId) -> Option<u64> {
        self.sessions.get(id).map(|s| s.generation)
    }

    /// Retained output of a live session
    pub fn get_history(&self, id: &InstanceId) -> Option<Vec<u8>> {
        let session = self.session(id)?;
        let history = session.history.lock().unwrap_or_else(|e| e.into_inner());
        Some(history.snapshot())
    }

    /// Live working directory; `None` when unknown or the probe failed
    pub async fn get_cwd(&self, id: &InstanceId) -> Option<PathBuf> {
        let session = self.session(id)?;
        session.backend.cwd().await
    }

    /// Atomically snapshot history and start receiving new output
    pub fn attach(&self, id: &InstanceId) -> Option<Attachment> {
        self.session(id).map(|session| session.attach())
    }

    pub fn info(&self, id: &InstanceId) -> Option<SessionInfo> {
        let session = self.session(id)?;
        let size = *session.size.lock().unwrap_or_else(|e| e.into_inner());
        let history_len = session
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        Some(SessionInfo {
            instance_id: id.clone(),
            config: session.config.clone(),
            size,
            pid: session.backend.pid(),
            history_len,
            created_at: session.created_at,
        })
    }

    /// Ids of all live sessions
    pub fn list(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = self.sessions.iter().map(|s| s.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Kill every live session
    pub async fn shutdown(&self) {
        for id in self.list() {
            if let Err(e) = self.kill(&id).await {
                if !e.is_not_found() {
                    tracing::warn!("Failed to kill {} during shutdown: {}", id, e);
                }
            }
        }
    }
}

/// Move backend events into history, attached viewers and the manager channel
async fn pump(
    id: InstanceId,
    session: Arc<Session>,
    mut rx: mpsc::Receiver<BackendEvent>,
    sessions: Arc<DashMap<InstanceId, Arc<Session>>>,
    gates: Arc<DashMap<InstanceId, Arc<tokio::sync::Mutex<()>>>>,
    events: broadcast::Sender<TerminalEvent>,
) {
    let source = if session.config.is_remote() {
        SignalSource::RemotePoll
    } else {
        SignalSource::LocalPoll
    };

    let mut code = None;
    while let Some(event) = rx.recv().await {
        match event {
            BackendEvent::Data(chunk) => {
                session.record(chunk);
                let _ = events.send(TerminalEvent::Activity {
                    instance_id: id.clone(),
                    source,
                });
            }
            BackendEvent::Exit(exit_code) => {
                code = exit_code;
                break;
            }
        }
    }

    // A respawn may already have registered a newer session under this id
    let removed = sessions
        .remove_if(&id, |_, s| s.generation == session.generation)
        .is_some();
    if removed {
        release_gate(&gates, &id);
    }
    tracing::info!(
        "Session {} exited with {:?}{}",
        id,
        code,
        if removed { "" } else { " (already unregistered)" }
    );

    let _ = session.output.send(SessionOutput::Exit(code));
    let _ = events.send(TerminalEvent::Exited {
        instance_id: id,
        generation: session.generation,
        code,
    });
}

/// Remove a gate only while no task holds or waits on it
fn release_gate(gates: &DashMap<InstanceId, Arc<tokio::sync::Mutex<()>>>, id: &InstanceId) {
    gates.remove_if(id, |_, gate| Arc::strong_count(gate) == 1);
}
