//! Admitted connections.
//!
//! A [`Connection`] is created by the gateway once a handshake succeeds. Its
//! role is computed at that moment and never changes afterwards.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tessera_protocol::Role;
use uuid::Uuid;

/// A resource identifier. Each resource has at most one room.
pub type ResourceId = String;

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0.simple())
    }
}

impl From<Uuid> for ConnectionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// An admitted realtime connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    /// Connection ID.
    pub id: ConnectionId,
    /// Resource whose room this connection belongs to.
    pub resource_id: ResourceId,
    /// Authenticated user.
    pub user_id: String,
    /// Role, fixed for the connection's lifetime.
    pub role: Role,
    /// Handshake time in milliseconds since the Unix epoch.
    pub established_at: u64,
}

impl Connection {
    /// Create a new connection with a fresh ID.
    #[must_use]
    pub fn new(resource_id: impl Into<ResourceId>, user_id: impl Into<String>, role: Role) -> Self {
        Self {
            id: ConnectionId::generate(),
            resource_id: resource_id.into(),
            user_id: user_id.into(),
            role,
            established_at: now_millis(),
        }
    }

    /// Check if this connection may author changes.
    #[must_use]
    pub fn is_controller(&self) -> bool {
        self.role == Role::Controller
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
