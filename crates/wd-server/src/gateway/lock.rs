//! Subscription and input lock index
//!
//! Tracks which connections watch which instance, in subscription order,
//! and which one of them may type. Every operation returns the lock notices
//! it causes so the caller can deliver them while still holding the gateway
//! state lock.

use std::collections::HashMap;

use wd_core::{ConnectionId, InstanceId, ProtocolError};

/// A lock notification addressed to one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockNotice {
    /// `to` now holds the lock
    Granted { to: ConnectionId },
    /// `to` does not hold the lock; `holder` does
    Status {
        to: ConnectionId,
        holder: Option<ConnectionId>,
    },
    /// The lock was released by its holder
    Released { to: ConnectionId },
    /// `to` asked for the lock while `holder` has it
    Denied {
        to: ConnectionId,
        holder: ConnectionId,
    },
}

impl LockNotice {
    pub fn recipient(&self) -> &ConnectionId {
        match self {
            LockNotice::Granted { to }
            | LockNotice::Status { to, .. }
            | LockNotice::Released { to }
            | LockNotice::Denied { to, .. } => to,
        }
    }
}

#[derive(Debug, Default)]
struct InstanceEntry {
    /// Longest-standing subscriber first
    subscribers: Vec<ConnectionId>,
    holder: Option<ConnectionId>,
}

impl InstanceEntry {
    fn is_subscribed(&self, conn: &ConnectionId) -> bool {
        self.subscribers.contains(conn)
    }

    /// Give the lock to `to` and tell everyone else who has it
    fn grant(&mut self, to: &ConnectionId) -> Vec<LockNotice> {
        self.holder = Some(to.clone());
        let mut notices = vec![LockNotice::Granted { to: to.clone() }];
        notices.extend(
            self.subscribers
                .iter()
                .filter(|c| *c != to)
                .map(|c| LockNotice::Status {
                    to: c.clone(),
                    holder: Some(to.clone()),
                }),
        );
        notices
    }

    /// Drop `conn`, handing the lock on if it held it
    fn remove(&mut self, conn: &ConnectionId) -> Vec<LockNotice> {
        self.subscribers.retain(|c| c != conn);
        if self.holder.as_ref() != Some(conn) {
            return Vec::new();
        }
        self.holder = None;
        match self.subscribers.first().cloned() {
            Some(next) => self.grant(&next),
            None => Vec::new(),
        }
    }
}

/// Subscriptions and input locks for all instances
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    instances: HashMap<InstanceId, InstanceEntry>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` as a subscriber of `id`.
    ///
    /// The first subscriber with no holder gets the lock; others learn who
    /// holds it. Re-subscribing only repeats the current lock state.
    pub fn subscribe(&mut self, id: &InstanceId, conn: &ConnectionId) -> Vec<LockNotice> {
        let entry = self.instances.entry(id.clone()).or_default();
        if !entry.is_subscribed(conn) {
            entry.subscribers.push(conn.clone());
        }

        match &entry.holder {
            None => entry.grant(conn),
            Some(holder) if holder == conn => vec![LockNotice::Granted { to: conn.clone() }],
            Some(holder) => vec![LockNotice::Status {
                to: conn.clone(),
                holder: Some(holder.clone()),
            }],
        }
    }

    /// Remove one subscription; returns the notices and whether `conn` was subscribed
    pub fn unsubscribe(&mut self, id: &InstanceId, conn: &ConnectionId) -> (Vec<LockNotice>, bool) {
        let Some(entry) = self.instances.get_mut(id) else {
            return (Vec::new(), false);
        };
        if !entry.is_subscribed(conn) {
            return (Vec::new(), false);
        }
        let notices = entry.remove(conn);
        if entry.subscribers.is_empty() {
            self.instances.remove(id);
        }
        (notices, true)
    }

    /// Remove every subscription of a closing connection
    pub fn remove_connection(&mut self, conn: &ConnectionId) -> Vec<(InstanceId, Vec<LockNotice>)> {
        let mut affected = Vec::new();
        for (id, entry) in self.instances.iter_mut() {
            if entry.is_subscribed(conn) {
                affected.push((id.clone(), entry.remove(conn)));
            }
        }
        self.instances.retain(|_, entry| !entry.subscribers.is_empty());
        affected.sort_by(|a, b| a.0.cmp(&b.0));
        affected
    }

    /// Forget an instance entirely, returning its former subscribers
    pub fn remove_instance(&mut self, id: &InstanceId) -> Vec<ConnectionId> {
        self.instances
            .remove(id)
            .map(|entry| entry.subscribers)
            .unwrap_or_default()
    }

    /// Explicit lock request
    pub fn request(
        &mut self,
        id: &InstanceId,
        conn: &ConnectionId,
    ) -> Result<Vec<LockNotice>, ProtocolError> {
        let entry = self
            .instances
            .get_mut(id)
            .filter(|entry| entry.is_subscribed(conn))
            .ok_or_else(|| ProtocolError::NotSubscribed(id.clone()))?;

        Ok(match entry.holder.clone() {
            None => entry.grant(conn),
            Some(holder) if &holder == conn => vec![LockNotice::Granted { to: conn.clone() }],
            Some(holder) => vec![LockNotice::Denied {
                to: conn.clone(),
                holder,
            }],
        })
    }

    /// Explicit release; ignored unless `conn` holds the lock
    pub fn release(&mut self, id: &InstanceId, conn: &ConnectionId) -> Vec<LockNotice> {
        let Some(entry) = self.instances.get_mut(id) else {
            return Vec::new();
        };
        if entry.holder.as_ref() != Some(conn) {
            return Vec::new();
        }
        entry.holder = None;
        entry
            .subscribers
            .iter()
            .map(|c| LockNotice::Released { to: c.clone() })
            .collect()
    }

    pub fn is_holder(&self, id: &InstanceId, conn: &ConnectionId) -> bool {
        self.holder(id) == Some(conn)
    }

    pub fn holder(&self, id: &InstanceId) -> Option<&ConnectionId> {
        self.instances.get(id).and_then(|e| e.holder.as_ref())
    }

    pub fn is_subscribed(&self, id: &InstanceId, conn: &ConnectionId) -> bool {
        self.instances
            .get(id)
            .is_some_and(|entry| entry.is_subscribed(conn))
    }

    pub fn subscribers(&self, id: &InstanceId) -> &[ConnectionId] {
        self.instances
            .get(id)
            .map(|e| e.subscribers.as_slice())
            .unwrap_or(&[])
    }

    /// Instances with at least one subscriber
    pub fn instances(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = self.instances.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether any instance has a subscriber
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
