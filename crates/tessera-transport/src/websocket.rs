//! WebSocket client transport.
//!
//! This module provides a WebSocket client using tokio-tungstenite. The
//! bearer token travels in the `Authorization` header of the upgrade
//! request; a rejected handshake surfaces as [`TransportError::Rejected`].

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use tessera_protocol::{codec, ClientEvent, Envelope};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::traits::{Connection, Connector, TransportError};

/// Wire encoding for outbound events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    /// JSON text frames.
    #[default]
    Text,
    /// Length-prefixed MessagePack binary frames.
    Binary,
}

/// WebSocket client configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Base URL of the server, e.g. `ws://127.0.0.1:8080`.
    pub base_url: String,
    /// Bearer token presented at handshake.
    pub token: String,
    /// Outbound frame encoding.
    pub encoding: Encoding,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

/// Opens WebSocket connections to `/realtime/<resourceId>`.
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    /// Create a connector with text encoding.
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_config(WebSocketConfig {
            base_url: base_url.into(),
            token: token.into(),
            encoding: Encoding::Text,
            max_message_size: 64 * 1024, // 64 KB
        })
    }

    /// Create a connector with custom configuration.
    #[must_use]
    pub fn with_config(config: WebSocketConfig) -> Self {
        Self { config }
    }

    /// URL of the realtime endpoint for a resource.
    #[must_use]
    pub fn endpoint(&self, resource_id: &str) -> String {
        format!(
            "{}/realtime/{}",
            self.config.base_url.trim_end_matches('/'),
            resource_id
        )
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, resource_id: &str) -> Result<Box<dyn Connection>, TransportError> {
        let url = self.endpoint(resource_id);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.config.token))
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        debug!("Connecting to {}", url);

        let (stream, _) = connect_async(request).await.map_err(|e| match e {
            WsError::Http(response) => {
                let status = response.status().as_u16();
                let message = response
                    .body()
                    .as_deref()
                    .map(|body| String::from_utf8_lossy(body).into_owned())
                    .unwrap_or_default();
                warn!("Handshake rejected with status {}: {}", status, message);
                TransportError::Rejected { status, message }
            }
            other => {
                error!("WebSocket connect failed: {}", other);
                TransportError::ConnectFailed(other.to_string())
            }
        })?;

        info!("Connected to {}", url);

        Ok(Box::new(WebSocketConnection::new(
            stream,
            self.config.encoding,
            self.config.max_message_size,
        )))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// A client-side WebSocket connection.
pub struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    encoding: Encoding,
    is_open: bool,
    read_buffer: BytesMut,
    max_message_size: usize,
}

impl WebSocketConnection {
    fn new(
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        encoding: Encoding,
        max_message_size: usize,
    ) -> Self {
        Self {
            stream,
            encoding,
            is_open: true,
            read_buffer: BytesMut::with_capacity(4096),
            max_message_size,
        }
    }

    fn closed(&mut self) -> Result<Option<Envelope>, TransportError> {
        self.is_open = false;
        Ok(None)
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        if let Some(envelope) = codec::decode_from(&mut self.read_buffer)? {
            return Ok(Some(envelope));
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(codec::decode_text(&text)?));
                }
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > self.max_message_size {
                        warn!(
                            "Message too large: {} bytes (max: {})",
                            data.len(),
                            self.max_message_size
                        );
                        return Err(TransportError::Protocol(
                            tessera_protocol::ProtocolError::FrameTooLarge(data.len()),
                        ));
                    }

                    self.read_buffer.extend_from_slice(&data);
                    if let Some(envelope) = codec::decode_from(&mut self.read_buffer)? {
                        return Ok(Some(envelope));
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        warn!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!("Received close frame: {:?}", frame);
                    return self.closed();
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("WebSocket stream ended");
                    return self.closed();
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn send(&mut self, event: ClientEvent) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        let envelope = event.into_envelope();
        let message = match self.encoding {
            Encoding::Text => Message::Text(codec::encode_text(&envelope)?),
            Encoding::Binary => Message::Binary(codec::encode(&envelope)?.to_vec()),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;

        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}
