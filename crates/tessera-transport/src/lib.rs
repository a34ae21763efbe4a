//! # tessera-transport
//!
//! Client side of the Tessera realtime connection.
//!
//! - **State machine** - `Idle → Connecting → Connected ⇄ Disconnected`
//! - **Retry policy** - Exponential backoff with a retry budget
//! - **WebSocket** - `tokio-tungstenite` client for `/realtime/<resourceId>`
//! - **Session** - Drives reconnects and reports link status to the sync
//!   coordinator
//!
//! ```rust,ignore
//! use tessera_transport::{Session, SessionConfig, WebSocketConnector};
//!
//! let connector = WebSocketConnector::new("ws://127.0.0.1:8080", token);
//! let session = Session::new(Arc::new(connector), SessionConfig::default())
//!     .with_sync(sync.clone());
//! session.run("42", outbound_rx, inbound_tx).await?;
//! ```

pub mod client;
pub mod session;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use client::{ClientError, ClientState, RetryPolicy};
pub use session::{Session, SessionConfig, SessionError};
pub use traits::{Connection, Connector, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{Encoding, WebSocketConfig, WebSocketConnection, WebSocketConnector};
