//! Shared test doubles for the server integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use wd_core::protocol::ServerMessage;
use wd_core::{InstanceId, MachineId, TerminalError, TerminalSize, TunnelError};
use wd_terminal::{BackendEvent, BackendSpawner, SpawnConfig, TerminalBackend};
use wd_tunnel::{TunnelConnector, TunnelLink};

#[derive(Default)]
struct Shared {
    senders: HashMap<InstanceId, mpsc::Sender<BackendEvent>>,
    input: HashMap<InstanceId, Vec<u8>>,
    sizes: HashMap<InstanceId, TerminalSize>,
    cwd: HashMap<InstanceId, PathBuf>,
    spawn_dirs: HashMap<InstanceId, Vec<PathBuf>>,
}

/// In-process spawner whose sessions are driven by the test
#[derive(Clone, Default)]
pub struct ScriptedSpawner {
    shared: Arc<Mutex<Shared>>,
    spawned: Arc<AtomicUsize>,
}

impl ScriptedSpawner {
    /// Emit output on a session as if the shell printed it
    pub async fn emit(&self, id: &InstanceId, data: &[u8]) {
        let sender = self.shared.lock().unwrap().senders.get(id).cloned();
        sender
            .expect("no session to emit on")
            .send(BackendEvent::Data(Bytes::copy_from_slice(data)))
            .await
            .unwrap();
    }

    /// End a session with an exit code
    pub async fn exit(&self, id: &InstanceId, code: Option<i32>) {
        let sender = self.shared.lock().unwrap().senders.remove(id);
        if let Some(sender) = sender {
            let _ = sender.send(BackendEvent::Exit(code)).await;
        }
    }

    /// Bytes written to a session's input so far
    pub fn input(&self, id: &InstanceId) -> Vec<u8> {
        self.shared
            .lock()
            .unwrap()
            .input
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn size(&self, id: &InstanceId) -> Option<TerminalSize> {
        self.shared.lock().unwrap().sizes.get(id).copied()
    }

    pub fn set_cwd(&self, id: &InstanceId, dir: &str) {
        self.shared
            .lock()
            .unwrap()
            .cwd
            .insert(id.clone(), PathBuf::from(dir));
    }

    /// Working directories each spawn of an instance started in
    pub fn spawn_dirs(&self, id: &InstanceId) -> Vec<PathBuf> {
        self.shared
            .lock()
            .unwrap()
            .spawn_dirs
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

struct ScriptedBackend {
    id: InstanceId,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::Sender<BackendEvent>,
}

#[async_trait]
impl TerminalBackend for ScriptedBackend {
    async fn write(&self, data: &[u8]) -> Result<(), TerminalError> {
        self.shared
            .lock()
            .unwrap()
            .input
            .entry(self.id.clone())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    async fn resize(&self, size: TerminalSize) -> Result<(), TerminalError> {
        self.shared
            .lock()
            .unwrap()
            .sizes
            .insert(self.id.clone(), size);
        Ok(())
    }

    async fn kill(&self) -> Result<(), TerminalError> {
        let _ = self.events.send(BackendEvent::Exit(None)).await;
        Ok(())
    }

    async fn cwd(&self) -> Option<PathBuf> {
        self.shared.lock().unwrap().cwd.get(&self.id).cloned()
    }
}

#[async_trait]
impl BackendSpawner for ScriptedSpawner {
    async fn spawn(
        &self,
        id: &InstanceId,
        config: &SpawnConfig,
        _size: TerminalSize,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<Box<dyn TerminalBackend>, TerminalError> {
        if config.working_dir().as_os_str() == "/unspawnable" {
            return Err(TerminalError::spawn_failed(id, "no such directory"));
        }
        {
            let mut shared = self.shared.lock().unwrap();
            shared.senders.insert(id.clone(), events.clone());
            shared
                .cwd
                .insert(id.clone(), config.working_dir().clone());
            shared
                .spawn_dirs
                .entry(id.clone())
                .or_default()
                .push(config.working_dir().clone());
        }
        self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedBackend {
            id: id.clone(),
            shared: self.shared.clone(),
            events,
        }))
    }
}

/// Connector for which every machine is unreachable
pub struct UnreachableConnector;

#[async_trait]
impl TunnelConnector for UnreachableConnector {
    async fn connect(
        &self,
        machine_id: &MachineId,
        _remote_port: u16,
        _local_port: u16,
    ) -> Result<Arc<dyn TunnelLink>, TunnelError> {
        Err(TunnelError::ConnectionFailure {
            machine: machine_id.clone(),
            reason: "connection refused".to_string(),
        })
    }
}

/// Next frame on a viewer queue, failing the test after a second
pub async fn next_frame(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("viewer queue closed")
}

/// Skip frames until one matches
pub async fn frame_matching<F>(
    rx: &mut mpsc::UnboundedReceiver<ServerMessage>,
    mut matches: F,
) -> ServerMessage
where
    F: FnMut(&ServerMessage) -> bool,
{
    loop {
        let frame = next_frame(rx).await;
        if matches(&frame) {
            return frame;
        }
    }
}

/// Drain whatever is queued right now
pub fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

/// Poll `check` until it holds, failing after a second
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held: {}", what);
}
