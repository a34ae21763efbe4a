//! Event types for the Tessera protocol.
//!
//! Events travel as [`Envelope`]s: `{"event": <name>, "payload": <json>}`.
//! Inbound envelopes are validated against a per-event schema before they are
//! routed, so the rest of the system only ever sees a typed [`ClientEvent`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::codec::ProtocolError;

/// Role of an admitted connection.
///
/// Owners and editors connect as controllers; everyone else observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// May author state changes and answer sync requests.
    Controller,
    /// May only observe and request synchronization.
    Viewer,
}

impl Role {
    /// Wire name of the role.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Controller => "controller",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named event with a JSON payload, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name.
    pub event: String,
    /// Event payload. Missing payloads decode as `null`.
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// Client event identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ViewUpdate,
    ItemUpdate,
    RequestSync,
    SyncResponse,
    HeartbeatPing,
}

impl EventKind {
    /// All client event kinds.
    pub const ALL: [EventKind; 5] = [
        EventKind::ViewUpdate,
        EventKind::ItemUpdate,
        EventKind::RequestSync,
        EventKind::SyncResponse,
        EventKind::HeartbeatPing,
    ];

    /// Look up an event kind by wire name.
    ///
    /// Returns `None` for names the protocol does not know.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Wire name of the event.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ViewUpdate => "view-update",
            EventKind::ItemUpdate => "item-update",
            EventKind::RequestSync => "request-sync",
            EventKind::SyncResponse => "sync-response",
            EventKind::HeartbeatPing => "heartbeat-ping",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct SyncResponsePayload {
    state: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatPayload {
    #[serde(default)]
    client_time: Option<u64>,
}

/// A validated event sent by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Controller changed the shared view.
    ViewUpdate(Map<String, Value>),
    /// Controller changed an item.
    ItemUpdate(Map<String, Value>),
    /// Viewer asks a controller for the current state.
    RequestSync,
    /// Controller answers a sync request with its state.
    SyncResponse { state: Value },
    /// Liveness check.
    HeartbeatPing { client_time: Option<u64> },
}

impl ClientEvent {
    /// Get the event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::ViewUpdate(_) => EventKind::ViewUpdate,
            ClientEvent::ItemUpdate(_) => EventKind::ItemUpdate,
            ClientEvent::RequestSync => EventKind::RequestSync,
            ClientEvent::SyncResponse { .. } => EventKind::SyncResponse,
            ClientEvent::HeartbeatPing { .. } => EventKind::HeartbeatPing,
        }
    }

    /// Validate an envelope into a typed event.
    ///
    /// Returns `Ok(None)` for unknown event names so callers can ignore them.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPayload`] if a known event carries a
    /// payload that does not match its schema.
    pub fn from_envelope(envelope: Envelope) -> Result<Option<Self>, ProtocolError> {
        let Some(kind) = EventKind::parse(&envelope.event) else {
            return Ok(None);
        };
        let invalid = |reason: &str| ProtocolError::InvalidPayload {
            event: kind.as_str(),
            reason: reason.to_string(),
        };

        let event = match kind {
            EventKind::ViewUpdate => match envelope.payload {
                Value::Object(map) => ClientEvent::ViewUpdate(map),
                _ => return Err(invalid("expected an object")),
            },
            EventKind::ItemUpdate => match envelope.payload {
                Value::Object(map) => ClientEvent::ItemUpdate(map),
                _ => return Err(invalid("expected an object")),
            },
            EventKind::RequestSync => ClientEvent::RequestSync,
            EventKind::SyncResponse => {
                let payload: SyncResponsePayload = serde_json::from_value(envelope.payload)
                    .map_err(|e| invalid(&e.to_string()))?;
                ClientEvent::SyncResponse {
                    state: payload.state,
                }
            }
            EventKind::HeartbeatPing => {
                let payload = match envelope.payload {
                    Value::Null => HeartbeatPayload::default(),
                    other => serde_json::from_value::<HeartbeatPayload>(other)
                        .map_err(|e| invalid(&e.to_string()))?,
                };
                ClientEvent::HeartbeatPing {
                    client_time: payload.client_time,
                }
            }
        };

        Ok(Some(event))
    }

    /// Convert the event back into its wire envelope.
    #[must_use]
    pub fn into_envelope(self) -> Envelope {
        let kind = self.kind();
        let payload = match self {
            ClientEvent::ViewUpdate(map) | ClientEvent::ItemUpdate(map) => Value::Object(map),
            ClientEvent::RequestSync => Value::Null,
            ClientEvent::SyncResponse { state } => serde_json::json!({ "state": state }),
            ClientEvent::HeartbeatPing { client_time } => match client_time {
                Some(t) => serde_json::json!({ "clientTime": t }),
                None => Value::Null,
            },
        };
        Envelope::new(kind.as_str(), payload)
    }
}

/// An event sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Handshake accepted.
    #[serde(rename_all = "camelCase")]
    Connected {
        resource_id: String,
        role: Role,
        user_id: String,
    },

    /// Error notification, delivered only to the offending connection.
    Error { message: String },

    /// Relayed `view-update`.
    ViewUpdated(Value),

    /// Relayed `item-update`.
    ItemUpdated(Value),

    /// A viewer asked for the current state.
    SyncRequested { from: String },

    /// Relayed `sync-response`.
    SyncResponse { state: Value },

    /// Answer to `heartbeat-ping`.
    #[serde(rename_all = "camelCase")]
    HeartbeatPong {
        server_time: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_time: Option<u64>,
    },
}

impl ServerEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::Error { .. } => "error",
            ServerEvent::ViewUpdated(_) => "view-updated",
            ServerEvent::ItemUpdated(_) => "item-updated",
            ServerEvent::SyncRequested { .. } => "sync-requested",
            ServerEvent::SyncResponse { .. } => "sync-response",
            ServerEvent::HeartbeatPong { .. } => "heartbeat-pong",
        }
    }

    /// Create an error event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    /// Convert the event into its wire envelope.
    #[must_use]
    pub fn into_envelope(self) -> Envelope {
        let event = self.name();
        let payload = match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("payload").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        Envelope::new(event, payload)
    }

    /// Decode a server event from an envelope.
    ///
    /// Returns `None` for events this protocol version does not model, such
    /// as collaborator-originated broadcasts.
    #[must_use]
    pub fn from_envelope(envelope: Envelope) -> Option<Self> {
        serde_json::from_value(serde_json::json!({
            "event": envelope.event,
            "payload": envelope.payload,
        }))
        .ok()
    }
}

impl From<ClientEvent> for Envelope {
    fn from(event: ClientEvent) -> Self {
        event.into_envelope()
    }
}

impl From<ServerEvent> for Envelope {
    fn from(event: ServerEvent) -> Self {
        event.into_envelope()
    }
}
