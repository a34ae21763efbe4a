//! Transport abstraction traits for Tessera clients.
//!
//! A [`Connector`] opens a [`Connection`] to one resource; the session only
//! talks to these traits, so the WebSocket client can be swapped for an
//! in-memory one in tests.

use async_trait::async_trait;
use tessera_protocol::{ClientEvent, Envelope};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// The server refused the handshake.
    #[error("Handshake rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Failed to establish the connection.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] tessera_protocol::ProtocolError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Check if retrying cannot help.
    ///
    /// Authentication, authorization and unknown-resource rejections come
    /// back the same on every attempt.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportError::Rejected { status, .. } if (400..500).contains(status))
    }
}

/// Opens connections to resources.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `resource_id`. Admission happens during the handshake.
    async fn connect(&self, resource_id: &str) -> Result<Box<dyn Connection>, TransportError>;

    /// Get the transport name (e.g., "websocket").
    fn name(&self) -> &'static str;
}

/// An open connection to one resource.
#[async_trait]
pub trait Connection: Send {
    /// Receive the next envelope from the server.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError>;

    /// Send a client event.
    async fn send(&mut self, event: ClientEvent) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_rejections() {
        let unauthorized = TransportError::Rejected {
            status: 401,
            message: "token expired".into(),
        };
        let unavailable = TransportError::Rejected {
            status: 503,
            message: "directory unavailable".into(),
        };

        assert!(unauthorized.is_terminal());
        assert!(!unavailable.is_terminal());
        assert!(!TransportError::ConnectionClosed.is_terminal());
        assert!(!TransportError::ConnectFailed("refused".into()).is_terminal());
    }
}
