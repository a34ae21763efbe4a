//! Connection handlers for Tessera server.
//!
//! Admission runs on the plain HTTP request, before the WebSocket upgrade, so
//! a rejected handshake never opens a socket. Each admitted socket runs one
//! task that writes the connection's outbox and routes inbound frames.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::{
    AdmissionError, Connection, ConnectionId, DisconnectReason, Gateway, Hub, HubConfig,
    JwtVerifier, RegistryConfig, RouteOutcome,
};
use tessera_protocol::{codec, Envelope, EventKind, ServerEvent};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Connection lifecycle and rooms.
    pub hub: Hub,
    /// Server configuration.
    pub config: Config,
    /// Connection slots held by handshakes and open sockets.
    reserved: AtomicUsize,
}

impl AppState {
    /// Create new app state.
    ///
    /// # Errors
    ///
    /// Returns an error if the JWT secret is unusable.
    pub fn new(config: Config) -> Result<Self> {
        let verifier =
            JwtVerifier::new(&config.auth.jwt_secret).context("Invalid auth.jwt_secret")?;
        let gateway = Gateway::new(Arc::new(verifier), Arc::new(config.directory()));
        let hub = Hub::with_config(
            gateway,
            HubConfig {
                registry: RegistryConfig {
                    max_rooms: config.limits.max_rooms,
                },
                outbox_capacity: config.limits.outbox_capacity,
            },
        );

        info!(resources = config.resources.len(), "Access directory seeded");
        Ok(Self {
            hub,
            config,
            reserved: AtomicUsize::new(0),
        })
    }

    /// Reserve a connection slot, or `None` at the connection limit.
    fn reserve_slot(self: &Arc<Self>) -> Option<ConnectionSlot> {
        let max = self.config.limits.max_connections;
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()?;
        Some(ConnectionSlot {
            state: Arc::clone(self),
        })
    }
}

/// A reserved connection slot, released on drop.
struct ConnectionSlot {
    state: Arc<AppState>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.reserved.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let realtime = format!(
        "{}/:resource_id",
        state.config.transport.realtime_path.trim_end_matches('/')
    );

    Router::new()
        .route(&realtime, get(ws_handler))
        .route("/resources/:resource_id/broadcast", post(broadcast_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone())?);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    spawn_reaper(Arc::clone(&state));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Tessera server listening on {}", addr);
    info!(
        "Realtime endpoint: ws://{}{}/<resourceId>",
        addr, config.transport.realtime_path
    );

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Evict connections that stopped talking.
fn spawn_reaper(state: Arc<AppState>) -> JoinHandle<()> {
    let interval = state.config.heartbeat.interval();
    let timeout = state.config.heartbeat.timeout();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let evicted = state.hub.evict_stale(timeout);
            if !evicted.is_empty() {
                warn!(count = evicted.len(), "Evicted connections after heartbeat timeout");
            }
            metrics::record_evictions(evicted.len(), "heartbeat");
            metrics::set_active_rooms(state.hub.registry().stats().room_count);
        }
    })
}

/// HTTP error body: `{"error": message}`.
#[derive(Debug)]
pub struct Rejection {
    status: StatusCode,
    message: String,
}

impl Rejection {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<AdmissionError> for Rejection {
    fn from(e: AdmissionError) -> Self {
        let status = match e {
            AdmissionError::Auth(_) => StatusCode::UNAUTHORIZED,
            AdmissionError::NotFound(_) => StatusCode::NOT_FOUND,
            AdmissionError::AccessDenied(_) => StatusCode::FORBIDDEN,
            AdmissionError::Directory(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        metrics::record_rejection(e.reason());
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Bearer token from the `Authorization` header, else the query string.
fn bearer_token(headers: &HeaderMap, query: Option<String>) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .or(query)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.registry().stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "rooms": stats.room_count,
        "connections": state.hub.presence().count(),
    }))
}

/// Collaborator broadcast handler.
async fn broadcast_handler(
    Path(resource_id): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<serde_json::Value>, Rejection> {
    let token = bearer_token(&headers, None);
    let caller = state.hub.admit(&resource_id, token.as_deref()).await?;
    if !caller.is_controller() {
        metrics::record_rejection("access_denied");
        return Err(Rejection::new(
            StatusCode::FORBIDDEN,
            "broadcast requires the controller role",
        ));
    }
    if envelope.event.is_empty() {
        return Err(Rejection::new(StatusCode::BAD_REQUEST, "event name is required"));
    }

    let report = state.hub.broadcast(&resource_id, envelope);
    metrics::record_fanout(report.delivered);
    metrics::record_evictions(report.evicted.len(), "stalled");
    debug!(resource = %resource_id, delivered = report.delivered, "Collaborator broadcast");

    Ok(Json(serde_json::json!({ "delivered": report.delivered })))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(resource_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Result<Response, Rejection> {
    // Held across admission so concurrent handshakes cannot overshoot.
    let Some(slot) = state.reserve_slot() else {
        metrics::record_rejection("capacity");
        return Err(Rejection::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "connection limit reached",
        ));
    };

    let token = bearer_token(&headers, query.token);
    let connection = state.hub.admit(&resource_id, token.as_deref()).await?;

    Ok(ws
        .max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, connection, state, slot)))
}

/// Handle an admitted WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    connection: Connection,
    state: Arc<AppState>,
    _slot: ConnectionSlot,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let id = connection.id;

    let (mut sender, mut receiver) = socket.split();

    let mut inbox = match state.hub.register(&connection) {
        Ok(inbox) => inbox,
        Err(e) => {
            error!(connection = %id, error = %e, "Failed to register connection");
            metrics::record_error("register");
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::AGAIN,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };
    metrics::set_active_rooms(state.hub.registry().stats().room_count);

    let send_timeout = Duration::from_millis(state.config.limits.send_timeout_ms);
    let mut read_buffer = BytesMut::with_capacity(4096);

    let reason = loop {
        tokio::select! {
            biased;

            outgoing = inbox.recv() => {
                let Some(message) = outgoing else {
                    // The room dropped our outbox: evicted.
                    let close = Message::Close(Some(CloseFrame {
                        code: close_code::POLICY,
                        reason: DisconnectReason::ServerInitiated.as_str().into(),
                    }));
                    let _ = tokio::time::timeout(send_timeout, sender.send(close)).await;
                    break DisconnectReason::ServerInitiated;
                };

                let text = match codec::encode_text(&message.envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(connection = %id, error = %e, "Failed to encode message");
                        metrics::record_error("encode");
                        continue;
                    }
                };
                metrics::record_message(text.len(), "outbound");

                match tokio::time::timeout(send_timeout, sender.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(connection = %id, error = %e, "Write failed");
                        break DisconnectReason::TransportError;
                    }
                    Err(_) => {
                        warn!(connection = %id, "Write stalled, disconnecting");
                        metrics::record_evictions(1, "send_timeout");
                        break DisconnectReason::ServerInitiated;
                    }
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_message(text.len(), "inbound");
                        match codec::decode_text(&text) {
                            Ok(envelope) => route_envelope(&state, &id, envelope),
                            Err(e) => reject_frame(&state, &connection, &e),
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        metrics::record_message(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);
                        loop {
                            match codec::decode_from(&mut read_buffer) {
                                Ok(Some(envelope)) => route_envelope(&state, &id, envelope),
                                Ok(None) => break,
                                Err(e) => {
                                    read_buffer.clear();
                                    reject_frame(&state, &connection, &e);
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        state.hub.presence().touch(&id);
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break DisconnectReason::TransportError;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        state.hub.presence().touch(&id);
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %id, "Received close frame");
                        break DisconnectReason::Normal;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break DisconnectReason::TransportError;
                    }
                    None => {
                        debug!(connection = %id, "WebSocket stream ended");
                        break DisconnectReason::Normal;
                    }
                }
            }
        }
    };

    state.hub.disconnect(&id, reason);
    metrics::set_active_rooms(state.hub.registry().stats().room_count);
}

/// Route one inbound envelope and record its outcome.
fn route_envelope(state: &AppState, id: &ConnectionId, envelope: Envelope) {
    let start = Instant::now();
    let event = EventKind::parse(&envelope.event).map_or("unknown", |kind| kind.as_str());

    let outcome = state.hub.route(id, envelope);
    let label = match &outcome {
        RouteOutcome::Broadcast { report, .. } => {
            metrics::record_fanout(report.delivered);
            metrics::record_evictions(report.evicted.len(), "stalled");
            "broadcast"
        }
        RouteOutcome::Replied => "replied",
        RouteOutcome::Denied { event, .. } => {
            metrics::record_denial(event.as_str());
            "denied"
        }
        RouteOutcome::Rejected { .. } => "rejected",
        RouteOutcome::Ignored => "ignored",
        RouteOutcome::UnknownConnection => "unknown_connection",
    };

    metrics::record_event(event, label);
    metrics::record_latency(start.elapsed().as_secs_f64());
}

/// Answer an undecodable frame with an error to the sender only.
fn reject_frame(state: &AppState, connection: &Connection, error: &tessera_protocol::ProtocolError) {
    debug!(connection = %connection.id, error = %error, "Malformed frame");
    metrics::record_error("malformed");
    state.hub.presence().touch(&connection.id);
    state.hub.registry().send_to(
        &connection.resource_id,
        &connection.id,
        ServerEvent::error(format!("malformed message: {error}")),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GrantSeed, ResourceSeed};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tessera_core::AccessRole;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::{
        connect_async, tungstenite::Error as WsError, tungstenite::Message as WsMessage,
        MaybeTlsStream, WebSocketStream,
    };

    const SECRET: &str = "tessera_test_secret_that_is_long_enough";

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    #[derive(Serialize)]
    struct Claims<'a> {
        sub: &'a str,
        exp: u64,
    }

    fn token(user: &str) -> String {
        let exp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 3600;
        encode(
            &Header::default(),
            &Claims { sub: user, exp },
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn seed(user: &str, role: AccessRole) -> GrantSeed {
        GrantSeed {
            user: user.into(),
            role,
        }
    }

    async fn start(config: Config) -> (SocketAddr, Arc<AppState>) {
        let state = Arc::new(AppState::new(config).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (addr, state)
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.auth.jwt_secret = SECRET.into();
        config.metrics.enabled = false;
        config.resources = vec![
            ResourceSeed {
                id: "42".into(),
                grants: vec![
                    seed("alice", AccessRole::Editor),
                    seed("bob", AccessRole::Viewer),
                ],
            },
            ResourceSeed {
                id: "7".into(),
                grants: Vec::new(),
            },
        ];
        config
    }

    async fn connect(addr: SocketAddr, resource: &str, user: &str) -> Client {
        let url = format!("ws://{addr}/realtime/{resource}?token={}", token(user));
        let (mut client, _) = connect_async(url).await.unwrap();
        let connected = next_event(&mut client).await;
        assert_eq!(connected.event, "connected");
        client
    }

    async fn next_event(client: &mut Client) -> Envelope {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for a message")
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = message {
                return codec::decode_text(&text).unwrap();
            }
        }
    }

    async fn send(client: &mut Client, event: &str, payload: Value) {
        let text = codec::encode_text(&Envelope::new(event, payload)).unwrap();
        client.send(WsMessage::Text(text)).await.unwrap();
    }

    async fn rejection_status(addr: SocketAddr, path: &str) -> u16 {
        match connect_async(format!("ws://{addr}{path}")).await {
            Err(WsError::Http(response)) => response.status().as_u16(),
            other => panic!("expected an HTTP rejection, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_handshake_rejections() {
        let (addr, _) = start(test_config()).await;

        assert_eq!(rejection_status(addr, "/realtime/42").await, 401);
        assert_eq!(
            rejection_status(addr, "/realtime/42?token=garbage").await,
            401
        );
        assert_eq!(
            rejection_status(addr, &format!("/realtime/99?token={}", token("alice"))).await,
            404
        );
        assert_eq!(
            rejection_status(addr, &format!("/realtime/7?token={}", token("alice"))).await,
            403
        );
    }

    #[tokio::test]
    async fn test_realtime_session() {
        let (addr, state) = start(test_config()).await;
        let mut alice = connect(addr, "42", "alice").await;
        let mut bob = connect(addr, "42", "bob").await;
        assert_eq!(state.hub.room_size("42"), 2);

        // Controller update reaches the viewer.
        send(&mut alice, "view-update", json!({"zoom": 2})).await;
        let update = next_event(&mut bob).await;
        assert_eq!(update.event, "view-updated");
        assert_eq!(update.payload, json!({"zoom": 2}));

        // Viewer update is denied and reaches nobody.
        send(&mut bob, "item-update", json!({"id": 1})).await;
        assert_eq!(next_event(&mut bob).await.event, "error");

        // Sync request goes to controllers.
        send(&mut bob, "request-sync", Value::Null).await;
        let request = next_event(&mut alice).await;
        assert_eq!(request.event, "sync-requested");
        assert_eq!(request.payload, json!({"from": "bob"}));

        send(&mut alice, "sync-response", json!({"state": {"zoom": 2}})).await;
        let response = next_event(&mut bob).await;
        assert_eq!(response.event, "sync-response");
        assert_eq!(response.payload, json!({"state": {"zoom": 2}}));

        // Alice never saw her own update or bob's denied one.
        send(&mut alice, "heartbeat-ping", json!({"clientTime": 5})).await;
        let pong = next_event(&mut alice).await;
        assert_eq!(pong.event, "heartbeat-pong");
        assert_eq!(pong.payload["clientTime"], 5);

        // Malformed text is answered to the sender only.
        alice.send(WsMessage::Text("not json".into())).await.unwrap();
        assert_eq!(next_event(&mut alice).await.event, "error");

        alice.close(None).await.unwrap();
        for _ in 0..50 {
            if state.hub.room_size("42") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.hub.room_size("42"), 1);
    }

    #[tokio::test]
    async fn test_binary_frames_are_routed() {
        let (addr, _) = start(test_config()).await;
        let mut alice = connect(addr, "42", "alice").await;
        let mut bob = connect(addr, "42", "bob").await;

        let frame = codec::encode(&Envelope::new("item-update", json!({"id": 3}))).unwrap();
        alice.send(WsMessage::Binary(frame.to_vec())).await.unwrap();

        let update = next_event(&mut bob).await;
        assert_eq!(update.event, "item-updated");
        assert_eq!(update.payload, json!({"id": 3}));
    }

    #[tokio::test]
    async fn test_evicted_connection_is_closed() {
        let (addr, state) = start(test_config()).await;
        let mut bob = connect(addr, "42", "bob").await;

        let evicted = state.hub.evict_stale(Duration::ZERO);
        if evicted.is_empty() {
            // Same millisecond as the handshake; force it out.
            let id = state.hub.presence().in_resource("42")[0].id;
            state.hub.evict(&id);
        }

        loop {
            match tokio::time::timeout(Duration::from_secs(5), bob.next()).await.unwrap() {
                Some(Ok(WsMessage::Close(frame))) => {
                    let frame = frame.unwrap();
                    assert_eq!(frame.reason, "server_initiated");
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => break,
            }
        }
        assert_eq!(state.hub.room_size("42"), 0);
    }

    async fn post_broadcast(addr: SocketAddr, user: &str, body: &Value) -> String {
        let body = body.to_string();
        let request = format!(
            "POST /resources/42/broadcast HTTP/1.1\r\n\
             Host: {addr}\r\n\
             Authorization: Bearer {}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{body}",
            token(user),
            body.len()
        );
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_collaborator_broadcast() {
        let (addr, _) = start(test_config()).await;
        let mut bob = connect(addr, "42", "bob").await;
        let body = json!({"event": "item-updated", "payload": {"id": 9}});

        let denied = post_broadcast(addr, "bob", &body).await;
        assert!(denied.starts_with("HTTP/1.1 403"), "{denied}");

        let accepted = post_broadcast(addr, "alice", &body).await;
        assert!(accepted.starts_with("HTTP/1.1 200"), "{accepted}");
        assert!(accepted.contains(r#"{"delivered":1}"#));

        let pushed = next_event(&mut bob).await;
        assert_eq!(pushed.event, "item-updated");
        assert_eq!(pushed.payload, json!({"id": 9}));
    }

    #[test]
    fn test_bearer_token_sources() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers, Some("q".into())), Some("q".into()));

        headers.insert(AUTHORIZATION, "Bearer h".parse().unwrap());
        assert_eq!(bearer_token(&headers, Some("q".into())), Some("h".into()));
        assert_eq!(bearer_token(&HeaderMap::new(), None), None);
    }

    #[test]
    fn test_weak_secret_is_refused() {
        let mut config = test_config();
        config.auth.jwt_secret = "short".into();
        assert!(AppState::new(config).is_err());
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = test_config();
        config.limits.max_connections = 1;
        let (addr, state) = start(config).await;

        let mut alice = connect(addr, "42", "alice").await;
        let path = format!("/realtime/42?token={}", token("bob"));
        assert_eq!(rejection_status(addr, &path).await, 503);

        // A refused handshake does not leak its slot.
        assert_eq!(state.reserved.load(Ordering::Acquire), 1);

        alice.close(None).await.unwrap();
        for _ in 0..50 {
            if state.reserved.load(Ordering::Acquire) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let _bob = connect(addr, "42", "bob").await;
        assert_eq!(state.hub.room_size("42"), 1);
    }
}
