//! Realtime viewer gateway
//!
//! Every viewer connection gets an outbound queue of [`ServerMessage`]s and
//! a set of per-instance forwarders that copy terminal output into it. The
//! subscription index, the input lock and the connection table live behind
//! one mutex so a disconnect removes the connection and hands its locks on
//! in a single step.

mod connection;
mod cwd;
mod lock;

pub use connection::serve_socket;
pub use cwd::DebouncedWriter;
pub use lock::{LockNotice, SubscriptionIndex};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;

use wd_core::config::GatewayConfig;
use wd_core::protocol::{ClientMessage, ErrorCode, ServerMessage};
use wd_core::store::{InstanceRecord, InstanceStore};
use wd_core::{ConnectionId, InstanceId, ProtocolError, TerminalError, TerminalSize};
use wd_terminal::{SessionOutput, SpawnConfig, TerminalManager};
use wd_tunnel::TunnelManager;

use cwd::CwdPoller;

/// Outbound queue of one viewer connection
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

struct ConnectionState {
    outbound: Outbound,
    forwarders: HashMap<InstanceId, AbortHandle>,
}

#[derive(Default)]
struct GatewayState {
    connections: HashMap<ConnectionId, ConnectionState>,
    index: SubscriptionIndex,
}

impl GatewayState {
    fn send(&self, conn: &ConnectionId, msg: ServerMessage) {
        if let Some(connection) = self.connections.get(conn) {
            let _ = connection.outbound.send(msg);
        }
    }

    fn deliver(&self, id: &InstanceId, notices: Vec<LockNotice>) {
        for notice in notices {
            let to = notice.recipient().clone();
            self.send(&to, lock_message(id, notice));
        }
    }
}

fn lock_message(id: &InstanceId, notice: LockNotice) -> ServerMessage {
    let instance_id = id.clone();
    match notice {
        LockNotice::Granted { .. } => ServerMessage::LockGranted { instance_id },
        LockNotice::Status { holder, .. } => ServerMessage::LockStatus {
            instance_id,
            has_lock: false,
            holder,
        },
        LockNotice::Released { .. } => ServerMessage::LockReleased { instance_id },
        LockNotice::Denied { holder, .. } => ServerMessage::LockDenied {
            instance_id,
            holder: Some(holder),
        },
    }
}

struct Inner {
    terminals: TerminalManager,
    tunnels: TunnelManager,
    store: Arc<dyn InstanceStore>,
    config: GatewayConfig,
    size: TerminalSize,
    state: Mutex<GatewayState>,
    cwd: CwdPoller,
    cwd_writer: DebouncedWriter,
    last_cwd: Mutex<HashMap<InstanceId, PathBuf>>,
}

/// Fan-out hub between viewers and terminal sessions
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    pub fn new(
        terminals: TerminalManager,
        tunnels: TunnelManager,
        store: Arc<dyn InstanceStore>,
        config: GatewayConfig,
    ) -> Self {
        let cwd_writer = DebouncedWriter::new(store.clone(), config.cwd_persist_debounce);
        Self {
            inner: Arc::new(Inner {
                terminals,
                tunnels,
                store,
                config,
                size: TerminalSize::default(),
                state: Mutex::new(GatewayState::default()),
                cwd: CwdPoller::default(),
                cwd_writer,
                last_cwd: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, GatewayState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a viewer. `connected` is always its first frame.
    pub fn connect(&self, outbound: Outbound) -> ConnectionId {
        let conn = ConnectionId::random();
        let _ = outbound.send(ServerMessage::Connected {
            connection_id: conn.clone(),
        });
        self.state().connections.insert(
            conn.clone(),
            ConnectionState {
                outbound,
                forwarders: HashMap::new(),
            },
        );
        tracing::debug!("Viewer {} connected", conn);
        conn
    }

    /// Drop a viewer with all its subscriptions, handing on any locks it held
    pub fn disconnect(&self, conn: &ConnectionId) {
        let mut state = self.state();
        let Some(connection) = state.connections.remove(conn) else {
            return;
        };
        for handle in connection.forwarders.values() {
            handle.abort();
        }
        for (id, notices) in state.index.remove_connection(conn) {
            state.deliver(&id, notices);
        }
        if state.index.is_empty() {
            self.inner.cwd.stop();
        }
        tracing::debug!("Viewer {} disconnected", conn);
    }

    /// Parse and dispatch one text frame
    pub async fn handle_text(&self, conn: &ConnectionId, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle_message(conn, msg).await,
            Err(e) => {
                tracing::debug!("Malformed frame from {}: {}", conn, e);
                self.send_error(conn, ErrorCode::InvalidMessage, ProtocolError::from(e), None);
            }
        }
    }

    /// Answer a binary frame
    pub fn handle_binary(&self, conn: &ConnectionId) {
        self.send_error(
            conn,
            ErrorCode::InvalidMessage,
            ProtocolError::UnsupportedFrame,
            None,
        );
    }

    pub async fn handle_message(&self, conn: &ConnectionId, msg: ClientMessage) {
        match msg {
            ClientMessage::Subscribe { instance_id } => self.subscribe(conn, &instance_id).await,
            ClientMessage::Unsubscribe { instance_id } => self.unsubscribe(conn, &instance_id),
            ClientMessage::Input { instance_id, data } => {
                self.input(conn, &instance_id, &data.into_bytes()).await
            }
            ClientMessage::Resize {
                instance_id,
                cols,
                rows,
            } => self.resize(conn, &instance_id, cols, rows).await,
            ClientMessage::RequestLock { instance_id } => self.request_lock(conn, &instance_id),
            ClientMessage::ReleaseLock { instance_id } => self.release_lock(conn, &instance_id),
            ClientMessage::Ping => {
                self.state().send(conn, ServerMessage::Pong);
            }
        }
    }

    fn send_error(
        &self,
        conn: &ConnectionId,
        code: ErrorCode,
        err: impl std::fmt::Display,
        instance_id: Option<InstanceId>,
    ) {
        self.state()
            .send(conn, ServerMessage::error(code, err.to_string(), instance_id));
    }

    async fn record(&self, id: &InstanceId) -> Option<InstanceRecord> {
        match self.inner.store.get(id).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Failed to load instance {}: {}", id, e);
                None
            }
        }
    }

    /// Subscribe a viewer to an instance, respawning its session if needed
    pub async fn subscribe(&self, conn: &ConnectionId, id: &InstanceId) {
        if self.state().index.is_subscribed(id, conn) {
            let mut state = self.state();
            let notices = state.index.subscribe(id, conn);
            state.deliver(id, notices);
            return;
        }

        match self.record(id).await {
            Some(record) => {
                if let Err(e) = self.ensure_session(&record).await {
                    tracing::warn!("Could not start session for {}: {}", id, e);
                    let code = if e.is_not_found() {
                        ErrorCode::NotFound
                    } else {
                        ErrorCode::SpawnFailed
                    };
                    self.send_error(conn, code, e, Some(id.clone()));
                    return;
                }
            }
            None if self.inner.terminals.has(id) => {}
            None => {
                self.send_error(
                    conn,
                    ErrorCode::NotFound,
                    TerminalError::NotFound(id.clone()),
                    Some(id.clone()),
                );
                return;
            }
        }

        let mut state = self.state();
        if !state.connections.contains_key(conn) {
            return;
        }
        let Some(attachment) = self.inner.terminals.attach(id) else {
            // The session ended between respawn and attach
            state.send(
                conn,
                ServerMessage::error(
                    ErrorCode::NotFound,
                    TerminalError::NotFound(id.clone()).to_string(),
                    Some(id.clone()),
                ),
            );
            return;
        };

        if !attachment.history.is_empty() {
            state.send(
                conn,
                ServerMessage::Data {
                    instance_id: id.clone(),
                    data: attachment.history,
                },
            );
        }

        let notices = state.index.subscribe(id, conn);
        state.deliver(id, notices);

        if let Some(connection) = state.connections.get_mut(conn) {
            let forwarder = tokio::spawn(forward_output(
                id.clone(),
                attachment.output,
                connection.outbound.clone(),
            ));
            if let Some(old) = connection
                .forwarders
                .insert(id.clone(), forwarder.abort_handle())
            {
                old.abort();
            }
        }

        tracing::debug!("Viewer {} subscribed to {}", conn, id);
        self.inner
            .cwd
            .start(self.clone(), self.inner.config.cwd_poll_interval);
    }

    async fn ensure_session(&self, record: &InstanceRecord) -> Result<(), TerminalError> {
        let id = &record.id;
        if self.inner.terminals.has(id) {
            return Ok(());
        }

        if let Some(machine_id) = record.machine.machine_id() {
            if let Err(e) = self.inner.tunnels.create_tunnel(id, machine_id).await {
                tracing::warn!("Tunnel to {} unavailable for {}: {}", machine_id, id, e);
            }
        }

        let config = SpawnConfig::for_machine(&record.machine, record.respawn_dir().clone());
        self.inner
            .terminals
            .ensure(id, config, self.inner.size)
            .await
            .map(|_| ())
    }

    pub fn unsubscribe(&self, conn: &ConnectionId, id: &InstanceId) {
        let mut state = self.state();
        let (notices, was_subscribed) = state.index.unsubscribe(id, conn);
        if !was_subscribed {
            return;
        }
        if let Some(handle) = state
            .connections
            .get_mut(conn)
            .and_then(|c| c.forwarders.remove(id))
        {
            handle.abort();
        }
        state.deliver(id, notices);
        if state.index.is_empty() {
            self.inner.cwd.stop();
        }
        tracing::debug!("Viewer {} unsubscribed from {}", conn, id);
    }

    /// Keystrokes reach the terminal only from the lock holder
    pub async fn input(&self, conn: &ConnectionId, id: &InstanceId, data: &[u8]) {
        if !self.state().index.is_holder(id, conn) {
            tracing::trace!("Dropping input from non-holder {} for {}", conn, id);
            return;
        }
        if let Err(e) = self.inner.terminals.write(id, data).await {
            self.send_error(conn, terminal_error_code(&e), e, Some(id.clone()));
        }
    }

    pub async fn resize(&self, conn: &ConnectionId, id: &InstanceId, cols: u16, rows: u16) {
        if !self.state().index.is_holder(id, conn) {
            return;
        }
        if let Err(e) = self.inner.terminals.resize(id, cols, rows).await {
            self.send_error(conn, terminal_error_code(&e), e, Some(id.clone()));
        }
    }

    pub fn request_lock(&self, conn: &ConnectionId, id: &InstanceId) {
        let mut state = self.state();
        match state.index.request(id, conn) {
            Ok(notices) => state.deliver(id, notices),
            Err(e) => state.send(
                conn,
                ServerMessage::error(ErrorCode::NotSubscribed, e.to_string(), Some(id.clone())),
            ),
        }
    }

    pub fn release_lock(&self, conn: &ConnectionId, id: &InstanceId) {
        let mut state = self.state();
        let notices = state.index.release(id, conn);
        state.deliver(id, notices);
    }

    /// Send a frame to every connection
    pub fn broadcast_all(&self, msg: ServerMessage) {
        let state = self.state();
        for connection in state.connections.values() {
            let _ = connection.outbound.send(msg.clone());
        }
    }

    /// Drop all subscriptions to a session that has ended.
    ///
    /// Forwarders are left to finish on their own so the `exit` frame
    /// still reaches every viewer.
    pub fn session_ended(&self, id: &InstanceId) {
        let mut state = self.state();
        for conn in state.index.remove_instance(id) {
            if let Some(connection) = state.connections.get_mut(&conn) {
                connection.forwarders.remove(id);
            }
        }
        if state.index.is_empty() {
            self.inner.cwd.stop();
        }
        drop(state);
        self.last_cwd().remove(id);
    }

    /// Forget an instance that is being deleted
    pub fn instance_removed(&self, id: &InstanceId) {
        self.session_ended(id);
        self.inner.cwd_writer.cancel(id);
    }

    fn last_cwd(&self) -> MutexGuard<'_, HashMap<InstanceId, PathBuf>> {
        self.inner.last_cwd.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Probe every subscribed instance once for its working directory
    pub async fn poll_cwd_once(&self) {
        let ids = self.state().index.instances();
        if ids.is_empty() {
            return;
        }

        let probes = ids.iter().map(|id| self.inner.terminals.get_cwd(id));
        let results = futures::future::join_all(probes).await;

        for (id, cwd) in ids.into_iter().zip(results) {
            let Some(cwd) = cwd else {
                continue;
            };

            let previous = self.last_cwd().get(&id).cloned();
            let previous = match previous {
                Some(dir) => Some(dir),
                None => self.record(&id).await.map(|r| r.respawn_dir().clone()),
            };
            self.last_cwd().insert(id.clone(), cwd.clone());

            if previous.as_ref() == Some(&cwd) {
                continue;
            }

            tracing::debug!("Cwd of {} is now {}", id, cwd.display());
            self.broadcast_all(ServerMessage::CwdChanged {
                instance_id: id.clone(),
                cwd: cwd.to_string_lossy().into_owned(),
            });
            self.inner.cwd_writer.schedule(id, cwd);
        }
    }

    /// Stop background work
    pub fn shutdown(&self) {
        self.inner.cwd.stop();
        let mut state = self.state();
        for connection in state.connections.values() {
            for handle in connection.forwarders.values() {
                handle.abort();
            }
        }
        state.connections.clear();
    }

    pub fn connection_count(&self) -> usize {
        self.state().connections.len()
    }

    pub fn lock_holder(&self, id: &InstanceId) -> Option<ConnectionId> {
        self.state().index.holder(id).cloned()
    }

    pub fn subscribers(&self, id: &InstanceId) -> Vec<ConnectionId> {
        self.state().index.subscribers(id).to_vec()
    }

    /// Whether the shared working-directory poll is running
    pub fn cwd_polling(&self) -> bool {
        self.inner.cwd.is_running()
    }

    /// Completed working-directory poll ticks since start
    pub fn cwd_poll_ticks(&self) -> u64 {
        self.inner.cwd.ticks()
    }
}

fn terminal_error_code(e: &TerminalError) -> ErrorCode {
    if e.is_not_found() {
        ErrorCode::NotFound
    } else {
        ErrorCode::Internal
    }
}

/// Copy one session's output into a viewer's queue until the session exits
async fn forward_output(
    id: InstanceId,
    mut output: broadcast::Receiver<SessionOutput>,
    outbound: Outbound,
) {
    loop {
        let msg = match output.recv().await {
            Ok(SessionOutput::Data(chunk)) => ServerMessage::Data {
                instance_id: id.clone(),
                data: chunk.to_vec(),
            },
            Ok(SessionOutput::Exit(code)) => {
                let _ = outbound.send(ServerMessage::Exit {
                    instance_id: id.clone(),
                    code,
                });
                break;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Viewer lagged on {}: {} chunks dropped", id, skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if outbound.send(msg).is_err() {
            break;
        }
    }
}
