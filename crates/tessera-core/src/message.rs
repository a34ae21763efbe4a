//! Outbound message types.
//!
//! Every member of a room owns a bounded [`Outbox`]. Messages are shared
//! between recipients behind an `Arc`, so a broadcast clones one pointer per
//! member.

use crate::connection::{now_millis, ConnectionId, ResourceId};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessera_protocol::Envelope;
use tokio::sync::mpsc;

/// A unique message identifier.
pub type MessageId = u64;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Sending half of a connection's delivery queue.
pub type Outbox = mpsc::Sender<Arc<Message>>;

/// Receiving half of a connection's delivery queue.
pub type Inbox = mpsc::Receiver<Arc<Message>>;

/// Create a bounded delivery queue.
#[must_use]
pub fn outbox(capacity: usize) -> (Outbox, Inbox) {
    mpsc::channel(capacity.max(1))
}

/// A message queued for delivery to room members.
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Connection that caused the message, if any.
    pub source: Option<ConnectionId>,
    /// Target resource room.
    pub resource_id: ResourceId,
    /// Event and payload.
    pub envelope: Envelope,
    /// Timestamp when the message was created.
    pub timestamp: u64,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(resource_id: impl Into<ResourceId>, envelope: impl Into<Envelope>) -> Self {
        Self {
            id: generate_message_id(),
            source: None,
            resource_id: resource_id.into(),
            envelope: envelope.into(),
            timestamp: now_millis(),
        }
    }

    /// Create a message with a source connection.
    #[must_use]
    pub fn with_source(mut self, source: ConnectionId) -> Self {
        self.source = Some(source);
        self
    }

    /// Get the event name.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.envelope.event
    }

    /// Get the payload.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.envelope.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_protocol::ServerEvent;

    #[test]
    fn test_message_creation() {
        let msg = Message::new("42", ServerEvent::ItemUpdated(json!({"x": 1})));
        assert_eq!(msg.resource_id, "42");
        assert_eq!(msg.event(), "item-updated");
        assert_eq!(msg.payload(), &json!({"x": 1}));
        assert!(msg.source.is_none());
    }

    #[test]
    fn test_message_with_source() {
        let source = ConnectionId::generate();
        let msg = Message::new("42", Envelope::new("library-renamed", json!({}))).with_source(source);
        assert_eq!(msg.source, Some(source));
    }

    #[test]
    fn test_unique_message_ids() {
        let id1 = generate_message_id();
        let id2 = generate_message_id();
        assert!(id2 > id1);
    }
}
