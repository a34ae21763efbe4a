//! Presence tracking for Tessera.
//!
//! The tracker remembers every admitted connection by ID so that a
//! disconnect can be resolved to the room it must leave, and so the event
//! router can look up the sender's role without trusting the client.

use crate::connection::{now_millis, Connection, ConnectionId};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Presence record for one connection.
#[derive(Debug, Clone, Serialize)]
pub struct PresenceEntry {
    /// The admitted connection.
    pub connection: Connection,
    /// Last activity timestamp.
    pub last_seen: u64,
}

impl PresenceEntry {
    fn new(connection: Connection) -> Self {
        Self {
            last_seen: connection.established_at,
            connection,
        }
    }

    /// Check if this entry has been silent longer than `timeout` as of `now`.
    #[must_use]
    pub fn is_stale_at(&self, now: u64, timeout: Duration) -> bool {
        now.saturating_sub(self.last_seen) > timeout.as_millis() as u64
    }
}

/// Per-connection metadata, keyed by connection ID.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    entries: DashMap<ConnectionId, PresenceEntry>,
}

impl PresenceTracker {
    /// Create a new presence tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of tracked connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Record a connection.
    ///
    /// Returns `true` if this is a new entry, `false` if it replaced one.
    pub fn record(&self, connection: Connection) -> bool {
        let id = connection.id;
        let is_new = self
            .entries
            .insert(id, PresenceEntry::new(connection))
            .is_none();
        if is_new {
            debug!(connection = %id, "Presence: recorded");
        }
        is_new
    }

    /// Forget a connection.
    ///
    /// Returns the removed connection, or `None` for an unknown ID.
    pub fn forget(&self, connection_id: &ConnectionId) -> Option<Connection> {
        let removed = self.entries.remove(connection_id).map(|(_, e)| e.connection);
        if removed.is_some() {
            debug!(connection = %connection_id, "Presence: forgotten");
        }
        removed
    }

    /// Get the connection for an ID.
    #[must_use]
    pub fn get(&self, connection_id: &ConnectionId) -> Option<Connection> {
        self.entries.get(connection_id).map(|e| e.connection.clone())
    }

    /// Update a connection's last seen timestamp.
    ///
    /// Returns `false` for an unknown ID.
    pub fn touch(&self, connection_id: &ConnectionId) -> bool {
        match self.entries.get_mut(connection_id) {
            Some(mut entry) => {
                entry.last_seen = now_millis();
                true
            }
            None => false,
        }
    }

    /// Connections silent for longer than `timeout`.
    #[must_use]
    pub fn stale(&self, timeout: Duration) -> Vec<Connection> {
        self.stale_at(now_millis(), timeout)
    }

    fn stale_at(&self, now: u64, timeout: Duration) -> Vec<Connection> {
        self.entries
            .iter()
            .filter(|e| e.is_stale_at(now, timeout))
            .map(|e| e.connection.clone())
            .collect()
    }

    /// Connections admitted to a resource.
    #[must_use]
    pub fn in_resource(&self, resource_id: &str) -> Vec<Connection> {
        self.entries
            .iter()
            .filter(|e| e.connection.resource_id == resource_id)
            .map(|e| e.connection.clone())
            .collect()
    }

    /// Snapshot of every entry.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    /// Check if presence is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
