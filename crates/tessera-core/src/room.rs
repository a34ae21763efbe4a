//! Room abstraction for Tessera.
//!
//! A room holds the connections currently subscribed to one resource. Each
//! member owns a bounded outbox, so delivery order is FIFO per member and a
//! slow member never blocks the others.

use crate::connection::{ConnectionId, ResourceId};
use crate::message::{Message, Outbox};
use std::collections::HashMap;
use std::sync::Arc;
use tessera_protocol::Role;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

/// Maximum resource ID length.
pub const MAX_RESOURCE_ID_LENGTH: usize = 128;

/// Validate a resource ID.
///
/// # Errors
///
/// Returns an error message if the resource ID is invalid.
pub fn validate_resource_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Resource id cannot be empty");
    }
    if id.len() > MAX_RESOURCE_ID_LENGTH {
        return Err("Resource id too long");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
    {
        return Err("Resource id contains invalid characters");
    }
    Ok(())
}

#[derive(Debug)]
struct Member {
    role: Role,
    outbox: Outbox,
}

/// Result of delivering one message to a set of members.
#[derive(Debug, Default)]
pub struct Fanout {
    /// Members whose outbox accepted the message.
    pub delivered: usize,
    /// Members whose outbox was full or closed.
    pub failed: Vec<ConnectionId>,
}

/// The set of connections subscribed to one resource.
#[derive(Debug)]
pub struct Room {
    resource_id: ResourceId,
    members: HashMap<ConnectionId, Member>,
}

impl Room {
    /// Create a new, empty room.
    #[must_use]
    pub fn new(resource_id: impl Into<ResourceId>) -> Self {
        Self {
            resource_id: resource_id.into(),
            members: HashMap::new(),
        }
    }

    /// Get the resource ID.
    #[must_use]
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Get the number of members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Check if a connection is a member.
    #[must_use]
    pub fn is_member(&self, connection_id: &ConnectionId) -> bool {
        self.members.contains_key(connection_id)
    }

    /// Add a connection to this room.
    ///
    /// Returns `false` and keeps the existing membership if the connection
    /// is already a member.
    pub fn join(&mut self, connection_id: ConnectionId, role: Role, outbox: Outbox) -> bool {
        if self.members.contains_key(&connection_id) {
            return false;
        }
        self.members.insert(connection_id, Member { role, outbox });
        debug!(resource = %self.resource_id, connection = %connection_id, role = %role, "Connection joined room");
        true
    }

    /// Remove a connection from this room.
    ///
    /// Returns `true` if the connection was a member. Dropping the member's
    /// outbox closes its delivery queue.
    pub fn leave(&mut self, connection_id: &ConnectionId) -> bool {
        let removed = self.members.remove(connection_id).is_some();
        if removed {
            debug!(resource = %self.resource_id, connection = %connection_id, "Connection left room");
        }
        removed
    }

    /// Deliver a message to every member accepted by `filter`.
    ///
    /// Never waits: a member whose outbox is full or closed is reported in
    /// [`Fanout::failed`] instead.
    pub fn deliver<F>(&self, message: &Arc<Message>, filter: F) -> Fanout
    where
        F: Fn(&ConnectionId, Role) -> bool,
    {
        let mut fanout = Fanout::default();
        for (id, member) in &self.members {
            if !filter(id, member.role) {
                continue;
            }
            match member.outbox.try_send(Arc::clone(message)) {
                Ok(()) => fanout.delivered += 1,
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                    fanout.failed.push(*id);
                }
            }
        }
        trace!(
            resource = %self.resource_id,
            event = message.event(),
            delivered = fanout.delivered,
            failed = fanout.failed.len(),
            "Delivered message"
        );
        fanout
    }

    /// Deliver a message to one member.
    ///
    /// Returns `None` if the connection is not a member, otherwise whether
    /// its outbox accepted the message.
    pub fn send_to(&self, connection_id: &ConnectionId, message: Arc<Message>) -> Option<bool> {
        self.members
            .get(connection_id)
            .map(|member| member.outbox.try_send(message).is_ok())
    }

    /// Check if the room is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::outbox;
    use serde_json::json;
    use tessera_protocol::ServerEvent;

    fn message() -> Arc<Message> {
        Arc::new(Message::new("42", ServerEvent::ItemUpdated(json!({"x": 1}))))
    }

    #[test]
    fn test_room_creation() {
        let room = Room::new("42");
        assert_eq!(room.resource_id(), "42");
        assert_eq!(room.member_count(), 0);
        assert!(room.is_empty());
    }

    #[test]
    fn test_room_join_is_idempotent() {
        let mut room = Room::new("42");
        let id = ConnectionId::generate();
        let (tx, _rx) = outbox(4);

        assert!(room.join(id, Role::Controller, tx.clone()));
        assert!(!room.join(id, Role::Viewer, tx));
        assert_eq!(room.member_count(), 1);

        // The first join's role stands.
        let fanout = room.deliver(&message(), |_, role| role == Role::Controller);
        assert_eq!(fanout.delivered, 1);

        assert!(room.leave(&id));
        assert!(!room.leave(&id));
        assert!(room.is_empty());
    }

    #[test]
    fn test_resource_id_validation() {
        assert!(validate_resource_id("42").is_ok());
        assert!(validate_resource_id("screen:7f3a-b2").is_ok());
        assert!(validate_resource_id("").is_err());
        assert!(validate_resource_id("../etc").is_err());
        assert!(validate_resource_id("a b").is_err());

        let long_id = "a".repeat(MAX_RESOURCE_ID_LENGTH + 1);
        assert!(validate_resource_id(&long_id).is_err());
    }

    #[tokio::test]
    async fn test_deliver_respects_filter() {
        let mut room = Room::new("42");
        let sender = ConnectionId::generate();
        let other = ConnectionId::generate();
        let (tx1, mut rx1) = outbox(4);
        let (tx2, mut rx2) = outbox(4);
        room.join(sender, Role::Controller, tx1);
        room.join(other, Role::Viewer, tx2);

        let fanout = room.deliver(&message(), |id, _| *id != sender);
        assert_eq!(fanout.delivered, 1);
        assert!(fanout.failed.is_empty());

        assert!(rx1.try_recv().is_err());
        let msg = rx2.recv().await.unwrap();
        assert_eq!(msg.event(), "item-updated");
    }

    #[test]
    fn test_deliver_reports_full_outbox() {
        let mut room = Room::new("42");
        let slow = ConnectionId::generate();
        let (tx, _rx) = outbox(1);
        room.join(slow, Role::Viewer, tx);

        assert_eq!(room.deliver(&message(), |_, _| true).delivered, 1);
        let fanout = room.deliver(&message(), |_, _| true);
        assert_eq!(fanout.delivered, 0);
        assert_eq!(fanout.failed, vec![slow]);
    }
}
