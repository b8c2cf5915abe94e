//! Instance store contract
//!
//! The persistent row store is owned by an external collaborator; the
//! control plane only reads instance records and writes the fields it is
//! responsible for (status, last-known working directory, status events).
//! [`MemoryStore`] is the in-process implementation used by default and in
//! tests.

use std::path::PathBuf;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::time::current_time_millis;
use crate::types::{InstanceId, InstanceStatus, MachineRef, SignalSource};

/// Persisted form of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: InstanceId,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Directory the instance was created in
    pub working_dir: PathBuf,
    /// Most recent working directory observed on the live session
    #[serde(default)]
    pub last_known_dir: Option<PathBuf>,
    #[serde(default)]
    pub machine: MachineRef,
    #[serde(default = "default_status")]
    pub status: InstanceStatus,
    /// Unix milliseconds
    #[serde(default)]
    pub created_at: u64,
    /// Unix milliseconds
    #[serde(default)]
    pub updated_at: u64,
}

fn default_status() -> InstanceStatus {
    InstanceStatus::Idle
}

impl InstanceRecord {
    /// New idle record stamped with the current time
    pub fn new(id: impl Into<InstanceId>, working_dir: impl Into<PathBuf>, machine: MachineRef) -> Self {
        let now = current_time_millis();
        Self {
            id: id.into(),
            name: None,
            working_dir: working_dir.into(),
            last_known_dir: None,
            machine,
            status: InstanceStatus::Idle,
            created_at: now,
            updated_at: now,
        }
    }

    /// Directory a respawned session should start in
    pub fn respawn_dir(&self) -> &PathBuf {
        self.last_known_dir.as_ref().unwrap_or(&self.working_dir)
    }
}

/// Entry in an instance's status event record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub instance_id: InstanceId,
    pub previous: InstanceStatus,
    pub status: InstanceStatus,
    pub source: SignalSource,
    pub reason: String,
    pub timestamp: u64,
}

/// Access to persisted instance rows
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Fetch one instance record
    async fn get(&self, id: &InstanceId) -> Result<Option<InstanceRecord>, StoreError>;

    /// All known instance records
    async fn list(&self) -> Result<Vec<InstanceRecord>, StoreError>;

    /// Insert or replace a record
    async fn upsert(&self, record: InstanceRecord) -> Result<(), StoreError>;

    /// Delete a record, returning it if it existed
    async fn remove(&self, id: &InstanceId) -> Result<Option<InstanceRecord>, StoreError>;

    /// Persist the authoritative status
    async fn set_status(&self, id: &InstanceId, status: InstanceStatus) -> Result<(), StoreError>;

    /// Persist the last-known working directory
    async fn set_working_dir(&self, id: &InstanceId, dir: PathBuf) -> Result<(), StoreError>;

    /// Append to the instance's status event record
    async fn append_event(&self, event: StatusEvent) -> Result<(), StoreError>;

    /// Status events recorded for an instance, oldest first
    async fn events(&self, id: &InstanceId) -> Result<Vec<StatusEvent>, StoreError>;
}

/// In-memory instance store
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<InstanceId, InstanceRecord>,
    events: DashMap<InstanceId, Vec<StatusEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn get(&self, id: &InstanceId) -> Result<Option<InstanceRecord>, StoreError> {
        Ok(self.records.get(id).map(|r| r.clone()))
    }

    async fn list(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn upsert(&self, record: InstanceRecord) -> Result<(), StoreError> {
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn remove(&self, id: &InstanceId) -> Result<Option<InstanceRecord>, StoreError> {
        self.events.remove(id);
        Ok(self.records.remove(id).map(|(_, r)| r))
    }

    async fn set_status(&self, id: &InstanceId, status: InstanceStatus) -> Result<(), StoreError> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        record.status = status;
        record.updated_at = current_time_millis();
        Ok(())
    }

    async fn set_working_dir(&self, id: &InstanceId, dir: PathBuf) -> Result<(), StoreError> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        record.last_known_dir = Some(dir);
        record.updated_at = current_time_millis();
        Ok(())
    }

    async fn append_event(&self, event: StatusEvent) -> Result<(), StoreError> {
        self.events
            .entry(event.instance_id.clone())
            .or_default()
            .push(event);
        Ok(())
    }

    async fn events(&self, id: &InstanceId) -> Result<Vec<StatusEvent>, StoreError> {
        Ok(self.events.get(id).map(|e| e.clone()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_crud() {
        let store = MemoryStore::new();
        let id = InstanceId::new("i1");
        store
            .upsert(InstanceRecord::new("i1", "/work", MachineRef::Local))
            .await
            .unwrap();

        store.set_status(&id, InstanceStatus::Working).await.unwrap();
        store.set_working_dir(&id, PathBuf::from("/work/sub")).await.unwrap();

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Working);
        assert_eq!(record.respawn_dir(), &PathBuf::from("/work/sub"));

        assert!(store.remove(&id).await.unwrap().is_some());
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_updates_on_missing_record_fail() {
        let store = MemoryStore::new();
        let result = store
            .set_status(&InstanceId::new("ghost"), InstanceStatus::Idle)
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_respawn_dir_falls_back_to_original() {
        let record = InstanceRecord::new("i1", "/origin", MachineRef::Local);
        assert_eq!(record.respawn_dir(), &PathBuf::from("/origin"));
    }

    #[tokio::test]
    async fn test_events_are_kept_in_order() {
        let store = MemoryStore::new();
        let id = InstanceId::new("i1");
        for (i, status) in [InstanceStatus::Working, InstanceStatus::Idle].into_iter().enumerate() {
            store
                .append_event(StatusEvent {
                    instance_id: id.clone(),
                    previous: InstanceStatus::Idle,
                    status,
                    source: SignalSource::Hook,
                    reason: format!("event {}", i),
                    timestamp: i as u64,
                })
                .await
                .unwrap();
        }
        let events = store.events(&id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].status, InstanceStatus::Idle);
    }
}
