//! # tessera-core
//!
//! Core of the Tessera realtime sync engine.
//!
//! This crate provides the building blocks behind a realtime connection:
//!
//! - **Gateway** - Authenticate and authorize a connection once, at handshake
//! - **Registry** - Per-resource rooms with sender-excluding broadcast
//! - **Router** - Role-gated dispatch of validated client events
//! - **Presence** - Per-connection metadata for lifecycle cleanup
//! - **Sync** - Optimistic mutations with debounced, rollback-capable commits
//! - **Hub** - Wires the above into the connect/route/disconnect lifecycle
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Gateway   │────▶│  Presence   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                                       │
//!        ▼                                       ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Router    │────▶│  Registry   │────▶│    Room     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!
//! ┌─────────────────┐     ┌──────────────┐
//! │ SyncCoordinator │────▶│ DurableStore │
//! └─────────────────┘     └──────────────┘
//! ```

pub mod auth;
pub mod connection;
pub mod directory;
pub mod gateway;
pub mod hub;
pub mod message;
pub mod patch;
pub mod presence;
pub mod registry;
pub mod room;
pub mod router;
pub mod sync;

pub use auth::{AuthError, Identity, JwtVerifier, TokenVerifier};
pub use connection::{Connection, ConnectionId, ResourceId};
pub use directory::{AccessDirectory, AccessRole, DirectoryError, InMemoryDirectory};
pub use gateway::{AdmissionError, Gateway};
pub use hub::{DisconnectReason, Hub, HubConfig};
pub use message::{Inbox, Message, Outbox};
pub use presence::PresenceTracker;
pub use registry::{BroadcastReport, RegistryConfig, RegistryError, RoomRegistry};
pub use room::Room;
pub use router::{EventRouter, RouteOutcome};
pub use sync::{
    CommitMode, CommitTicket, Committed, DurableStore, InMemoryStore, LinkStatus, SharedState,
    StoreError, SyncConfig, SyncCoordinator, SyncError,
};
pub use tessera_protocol::Role;
