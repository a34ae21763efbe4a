//! Room registry for Tessera.
//!
//! The registry owns every resource room and routes broadcasts to their
//! members. Membership is mutated under the map's per-shard lock, and a room
//! entry is pruned as soon as its last member leaves.

use crate::connection::{ConnectionId, ResourceId};
use crate::message::{Message, Outbox};
use crate::room::{validate_resource_id, Room};
use dashmap::DashMap;
use std::sync::Arc;
use tessera_protocol::{Envelope, Role};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Invalid resource ID.
    #[error("Invalid resource id: {0}")]
    InvalidResource(&'static str),

    /// Maximum number of rooms reached.
    #[error("Maximum rooms reached")]
    MaxRoomsReached,
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of concurrently open rooms.
    pub max_rooms: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { max_rooms: 10_000 }
    }
}

/// Outcome of a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Number of members that received the message.
    pub delivered: usize,
    /// Members evicted because their outbox was full or closed.
    pub evicted: Vec<ConnectionId>,
}

/// Tracks room membership per resource.
pub struct RoomRegistry {
    rooms: DashMap<ResourceId, Room>,
    config: RegistryConfig,
}

impl RoomRegistry {
    /// Create a new registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating room registry with config: {:?}", config);
        Self {
            rooms: DashMap::new(),
            config,
        }
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            room_count: self.rooms.len(),
            member_count: self.rooms.iter().map(|r| r.member_count()).sum(),
        }
    }

    /// Add a connection to a resource room, creating the room if needed.
    ///
    /// Joining twice is a no-op that returns `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource ID is invalid or the room limit is
    /// reached.
    pub fn join(
        &self,
        resource_id: &str,
        connection_id: ConnectionId,
        role: Role,
        outbox: Outbox,
    ) -> Result<bool, RegistryError> {
        validate_resource_id(resource_id).map_err(RegistryError::InvalidResource)?;

        if !self.rooms.contains_key(resource_id) && self.rooms.len() >= self.config.max_rooms {
            return Err(RegistryError::MaxRoomsReached);
        }

        let mut room = self.rooms.entry(resource_id.to_string()).or_insert_with(|| {
            debug!(resource = %resource_id, "Creating room");
            Room::new(resource_id)
        });

        let joined = room.join(connection_id, role, outbox);
        debug!(
            resource = %resource_id,
            connection = %connection_id,
            members = room.member_count(),
            joined,
            "Join"
        );

        Ok(joined)
    }

    /// Remove a connection from a resource room.
    ///
    /// Returns `true` if the connection was a member. The room is removed
    /// once it has no members left.
    pub fn leave(&self, resource_id: &str, connection_id: &ConnectionId) -> bool {
        let removed = match self.rooms.get_mut(resource_id) {
            Some(mut room) => room.leave(connection_id),
            None => false,
        };

        if removed
            && self
                .rooms
                .remove_if(resource_id, |_, room| room.is_empty())
                .is_some()
        {
            debug!(resource = %resource_id, "Pruned empty room");
        }

        removed
    }

    /// Broadcast to every member of a room except `exclude`.
    pub fn broadcast(
        &self,
        resource_id: &str,
        envelope: impl Into<Envelope>,
        exclude: Option<ConnectionId>,
    ) -> BroadcastReport {
        self.fanout(resource_id, envelope.into(), exclude, None)
    }

    /// Broadcast to the members of a room holding `role`, except `exclude`.
    pub fn broadcast_to_role(
        &self,
        resource_id: &str,
        envelope: impl Into<Envelope>,
        role: Role,
        exclude: Option<ConnectionId>,
    ) -> BroadcastReport {
        self.fanout(resource_id, envelope.into(), exclude, Some(role))
    }

    fn fanout(
        &self,
        resource_id: &str,
        envelope: Envelope,
        exclude: Option<ConnectionId>,
        role: Option<Role>,
    ) -> BroadcastReport {
        let mut message = Message::new(resource_id, envelope);
        if let Some(source) = exclude {
            message = message.with_source(source);
        }
        let message = Arc::new(message);

        let fanout = match self.rooms.get(resource_id) {
            Some(room) => room.deliver(&message, |id, member_role| {
                Some(*id) != exclude && role.map_or(true, |r| r == member_role)
            }),
            None => {
                trace!(resource = %resource_id, "Broadcast to empty room");
                return BroadcastReport::default();
            }
        };

        for id in &fanout.failed {
            warn!(resource = %resource_id, connection = %id, "Evicting stalled connection");
            self.leave(resource_id, id);
        }

        BroadcastReport {
            delivered: fanout.delivered,
            evicted: fanout.failed,
        }
    }

    /// Deliver a message to a single member.
    ///
    /// Returns `false` if the connection is not in the room. A member whose
    /// outbox is full is evicted.
    pub fn send_to(
        &self,
        resource_id: &str,
        connection_id: &ConnectionId,
        envelope: impl Into<Envelope>,
    ) -> bool {
        let message = Arc::new(Message::new(resource_id, envelope));
        let accepted = self
            .rooms
            .get(resource_id)
            .and_then(|room| room.send_to(connection_id, message));

        match accepted {
            Some(true) => true,
            Some(false) => {
                warn!(resource = %resource_id, connection = %connection_id, "Evicting stalled connection");
                self.leave(resource_id, connection_id);
                false
            }
            None => false,
        }
    }

    /// Check if a room exists.
    #[must_use]
    pub fn room_exists(&self, resource_id: &str) -> bool {
        self.rooms.contains_key(resource_id)
    }

    /// Get the member count for a room.
    #[must_use]
    pub fn room_size(&self, resource_id: &str) -> usize {
        self.rooms
            .get(resource_id)
            .map(|r| r.member_count())
            .unwrap_or(0)
    }

    /// Check if a connection is a member of a room.
    #[must_use]
    pub fn is_member(&self, resource_id: &str, connection_id: &ConnectionId) -> bool {
        self.rooms
            .get(resource_id)
            .map(|r| r.is_member(connection_id))
            .unwrap_or(false)
    }

    /// Get all open room IDs.
    #[must_use]
    pub fn room_ids(&self) -> Vec<ResourceId> {
        self.rooms.iter().map(|r| r.key().clone()).collect()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Number of open rooms.
    pub room_count: usize,
    /// Total number of memberships.
    pub member_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{outbox, Inbox};
    use serde_json::json;
    use tessera_protocol::ServerEvent;

    fn join(registry: &RoomRegistry, resource: &str, role: Role) -> (ConnectionId, Inbox) {
        let id = ConnectionId::generate();
        let (tx, rx) = outbox(8);
        registry.join(resource, id, role, tx).unwrap();
        (id, rx)
    }

    #[test]
    fn test_registry_join_leave() {
        let registry = RoomRegistry::new();

        let (id, _rx) = join(&registry, "42", Role::Controller);
        assert!(registry.room_exists("42"));
        assert_eq!(registry.room_size("42"), 1);

        assert!(registry.leave("42", &id));
        assert!(!registry.room_exists("42"));
        assert_eq!(registry.room_size("42"), 0);
        assert!(registry.room_ids().is_empty());
    }

    #[test]
    fn test_registry_join_is_idempotent() {
        let registry = RoomRegistry::new();
        let id = ConnectionId::generate();
        let (tx, _rx) = outbox(8);

        assert!(registry.join("42", id, Role::Viewer, tx.clone()).unwrap());
        assert!(!registry.join("42", id, Role::Viewer, tx).unwrap());
        assert_eq!(registry.room_size("42"), 1);
    }

    #[test]
    fn test_registry_invalid_resource() {
        let registry = RoomRegistry::new();
        let (tx, _rx) = outbox(8);

        assert!(matches!(
            registry.join("", ConnectionId::generate(), Role::Viewer, tx),
            Err(RegistryError::InvalidResource(_))
        ));
    }

    #[test]
    fn test_registry_room_limit() {
        let registry = RoomRegistry::with_config(RegistryConfig { max_rooms: 1 });
        let (_id, _rx) = join(&registry, "1", Role::Viewer);
        let (tx, _rx2) = outbox(8);

        assert!(matches!(
            registry.join("2", ConnectionId::generate(), Role::Viewer, tx.clone()),
            Err(RegistryError::MaxRoomsReached)
        ));
        // Joining an existing room is still allowed.
        assert!(registry
            .join("1", ConnectionId::generate(), Role::Viewer, tx)
            .is_ok());
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let registry = RoomRegistry::new();
        let (sender, mut sender_rx) = join(&registry, "42", Role::Controller);
        let mut others: Vec<_> = (0..3).map(|_| join(&registry, "42", Role::Viewer)).collect();

        let report = registry.broadcast(
            "42",
            ServerEvent::ItemUpdated(json!({"x": 1})),
            Some(sender),
        );
        assert_eq!(report.delivered, 3);
        assert!(report.evicted.is_empty());

        assert!(sender_rx.try_recv().is_err());
        for (_, rx) in &mut others {
            let msg = rx.try_recv().unwrap();
            assert_eq!(msg.event(), "item-updated");
            assert_eq!(msg.payload(), &json!({"x": 1}));
            assert_eq!(msg.source, Some(sender));
        }
    }

    #[test]
    fn test_broadcast_to_role() {
        let registry = RoomRegistry::new();
        let (viewer, mut viewer_rx) = join(&registry, "42", Role::Viewer);
        let (_, mut other_viewer_rx) = join(&registry, "42", Role::Viewer);
        let (_, mut controller_rx) = join(&registry, "42", Role::Controller);

        let report = registry.broadcast_to_role(
            "42",
            ServerEvent::SyncRequested {
                from: "v".into(),
            },
            Role::Controller,
            Some(viewer),
        );
        assert_eq!(report.delivered, 1);
        assert!(controller_rx.try_recv().is_ok());
        assert!(viewer_rx.try_recv().is_err());
        assert!(other_viewer_rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_is_fifo_per_connection() {
        let registry = RoomRegistry::new();
        let (_, mut rx) = join(&registry, "42", Role::Viewer);

        for i in 0..5 {
            registry.broadcast("42", ServerEvent::ItemUpdated(json!({"seq": i})), None);
        }
        for i in 0..5 {
            assert_eq!(rx.try_recv().unwrap().payload(), &json!({"seq": i}));
        }
    }

    #[test]
    fn test_stalled_member_is_evicted() {
        let registry = RoomRegistry::new();
        let slow = ConnectionId::generate();
        let (slow_tx, _slow_rx) = outbox(1);
        registry.join("42", slow, Role::Viewer, slow_tx).unwrap();
        let (_, mut fast_rx) = join(&registry, "42", Role::Viewer);

        registry.broadcast("42", ServerEvent::ItemUpdated(json!({"n": 1})), None);
        let report = registry.broadcast("42", ServerEvent::ItemUpdated(json!({"n": 2})), None);

        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, vec![slow]);
        assert!(!registry.is_member("42", &slow));
        assert_eq!(registry.room_size("42"), 1);
        assert_eq!(fast_rx.try_recv().unwrap().payload(), &json!({"n": 1}));
        assert_eq!(fast_rx.try_recv().unwrap().payload(), &json!({"n": 2}));
    }

    #[test]
    fn test_closed_member_is_evicted() {
        let registry = RoomRegistry::new();
        let (gone, rx) = join(&registry, "42", Role::Viewer);
        drop(rx);

        let report = registry.broadcast("42", ServerEvent::ItemUpdated(json!({})), None);
        assert_eq!(report.evicted, vec![gone]);
        assert!(!registry.room_exists("42"));
    }

    #[test]
    fn test_send_to_single_member() {
        let registry = RoomRegistry::new();
        let (target, mut target_rx) = join(&registry, "42", Role::Viewer);
        let (_, mut other_rx) = join(&registry, "42", Role::Viewer);

        assert!(registry.send_to("42", &target, ServerEvent::error("nope")));
        assert_eq!(target_rx.try_recv().unwrap().event(), "error");
        assert!(other_rx.try_recv().is_err());

        assert!(!registry.send_to("7", &target, ServerEvent::error("nope")));
    }

    #[test]
    fn test_registry_stats() {
        let registry = RoomRegistry::new();

        let _a = join(&registry, "1", Role::Viewer);
        let _b = join(&registry, "1", Role::Controller);
        let _c = join(&registry, "2", Role::Viewer);

        let stats = registry.stats();
        assert_eq!(stats.room_count, 2);
        assert_eq!(stats.member_count, 3);
    }
}
