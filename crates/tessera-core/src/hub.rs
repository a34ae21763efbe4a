//! Connection lifecycle.
//!
//! The hub ties admission, rooms, presence and routing together. A transport
//! calls [`Hub::admit`] before accepting a socket, [`Hub::register`] once it
//! is open, [`Hub::route`] for every inbound envelope and
//! [`Hub::disconnect`] when the socket goes away.
//!
//! The room holds the only sender for a connection's outbox. Removing the
//! member from its room closes the outbox, which ends the transport's write
//! loop.

use crate::connection::{Connection, ConnectionId};
use crate::gateway::{AdmissionError, Gateway};
use crate::message::{outbox, Inbox};
use crate::presence::PresenceTracker;
use crate::registry::{BroadcastReport, RegistryConfig, RegistryError, RoomRegistry};
use crate::router::{EventRouter, RouteOutcome};
use std::sync::Arc;
use std::time::Duration;
use tessera_protocol::{Envelope, ServerEvent};
use tracing::{debug, info, warn};

/// Default per-connection outbox capacity.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Registry limits.
    pub registry: RegistryConfig,
    /// Messages buffered per connection before it counts as stalled.
    pub outbox_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed the socket.
    Normal,
    /// The socket failed.
    TransportError,
    /// The server evicted the connection.
    ServerInitiated,
}

impl DisconnectReason {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Normal => "normal",
            DisconnectReason::TransportError => "transport_error",
            DisconnectReason::ServerInitiated => "server_initiated",
        }
    }
}

/// Owns the shared realtime state.
#[derive(Clone)]
pub struct Hub {
    gateway: Gateway,
    registry: Arc<RoomRegistry>,
    presence: Arc<PresenceTracker>,
    router: EventRouter,
    config: HubConfig,
}

impl Hub {
    /// Create a hub with default configuration.
    #[must_use]
    pub fn new(gateway: Gateway) -> Self {
        Self::with_config(gateway, HubConfig::default())
    }

    /// Create a hub with custom configuration.
    #[must_use]
    pub fn with_config(gateway: Gateway, config: HubConfig) -> Self {
        let registry = Arc::new(RoomRegistry::with_config(config.registry.clone()));
        let presence = Arc::new(PresenceTracker::new());
        let router = EventRouter::new(Arc::clone(&registry), Arc::clone(&presence));
        Self {
            gateway,
            registry,
            presence,
            router,
            config,
        }
    }

    /// Authenticate and authorize a pending connection.
    ///
    /// # Errors
    ///
    /// Returns the first failed admission check.
    pub async fn admit(
        &self,
        resource_id: &str,
        token: Option<&str>,
    ) -> Result<Connection, AdmissionError> {
        self.gateway.admit(resource_id, token).await
    }

    /// Register an admitted connection and join its room.
    ///
    /// The returned inbox yields `connected` first, then room traffic.
    ///
    /// # Errors
    ///
    /// Returns an error if the room cannot be joined. Nothing is left
    /// registered in that case.
    pub fn register(&self, connection: &Connection) -> Result<Inbox, RegistryError> {
        let (tx, rx) = outbox(self.config.outbox_capacity);
        self.presence.record(connection.clone());

        if let Err(e) = self
            .registry
            .join(&connection.resource_id, connection.id, connection.role, tx)
        {
            self.presence.forget(&connection.id);
            warn!(connection = %connection.id, error = %e, "Failed to join room");
            return Err(e);
        }

        self.registry.send_to(
            &connection.resource_id,
            &connection.id,
            ServerEvent::Connected {
                resource_id: connection.resource_id.clone(),
                role: connection.role,
                user_id: connection.user_id.clone(),
            },
        );

        info!(
            connection = %connection.id,
            resource = %connection.resource_id,
            members = self.registry.room_size(&connection.resource_id),
            "Connection registered"
        );
        Ok(rx)
    }

    /// Route an inbound envelope.
    pub fn route(&self, connection_id: &ConnectionId, envelope: Envelope) -> RouteOutcome {
        self.presence.touch(connection_id);
        self.router.route(connection_id, envelope)
    }

    /// Tear down a connection. Safe to call more than once.
    ///
    /// Returns the connection if it was still registered.
    pub fn disconnect(
        &self,
        connection_id: &ConnectionId,
        reason: DisconnectReason,
    ) -> Option<Connection> {
        let connection = self.presence.forget(connection_id)?;
        self.registry.leave(&connection.resource_id, connection_id);
        info!(
            connection = %connection_id,
            resource = %connection.resource_id,
            reason = reason.as_str(),
            "Connection closed"
        );
        Some(connection)
    }

    /// Broadcast to every member of a resource room.
    pub fn broadcast(&self, resource_id: &str, envelope: impl Into<Envelope>) -> BroadcastReport {
        self.registry.broadcast(resource_id, envelope, None)
    }

    /// Force a connection out.
    pub fn evict(&self, connection_id: &ConnectionId) -> Option<Connection> {
        self.disconnect(connection_id, DisconnectReason::ServerInitiated)
    }

    /// Evict every connection silent for longer than `timeout`.
    pub fn evict_stale(&self, timeout: Duration) -> Vec<ConnectionId> {
        let stale: Vec<ConnectionId> = self
            .presence
            .stale(timeout)
            .into_iter()
            .filter_map(|conn| self.evict(&conn.id).map(|c| c.id))
            .collect();
        if !stale.is_empty() {
            debug!(count = stale.len(), "Evicted stale connections");
        }
        stale
    }

    /// Get the member count for a room.
    #[must_use]
    pub fn room_size(&self, resource_id: &str) -> usize {
        self.registry.room_size(resource_id)
    }

    /// Shared room registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Shared presence tracker.
    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }
}
