//! Client session driver.
//!
//! A session owns the connection to one resource: it walks the client state
//! machine, reconnects with backoff, sends heartbeats, and mirrors the
//! connection state into the sync coordinator's link status so optimistic
//! commits queue while offline and roll back once the retry budget is spent.

use crate::client::{ClientError, ClientState, RetryPolicy};
use crate::traits::{Connection, Connector, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{LinkStatus, SyncCoordinator};
use tessera_protocol::{ClientEvent, Envelope};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Every retry failed.
    #[error("Retry budget exhausted after {0} attempts")]
    Exhausted(u32),

    /// The server refused the handshake; retrying cannot help.
    #[error("Handshake rejected: {0}")]
    Rejected(TransportError),

    /// Invalid state transition.
    #[error(transparent)]
    State(#[from] ClientError),
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Reconnect policy.
    pub retry: RetryPolicy,
    /// Heartbeat interval while connected.
    pub heartbeat_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

enum Pump {
    /// The application dropped its outbound sender.
    Finished,
    /// The connection went away.
    Lost,
}

/// Drives one client connection.
pub struct Session {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    state: watch::Sender<ClientState>,
    sync: Option<SyncCoordinator>,
}

impl Session {
    /// Create a session.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(ClientState::Idle);
        Self {
            connector,
            config,
            state,
            sync: None,
        }
    }

    /// Report link status to a sync coordinator.
    #[must_use]
    pub fn with_sync(mut self, sync: SyncCoordinator) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.state.borrow().clone()
    }

    /// Watch state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    fn transition(
        &self,
        step: impl FnOnce(&ClientState) -> Result<ClientState, ClientError>,
    ) -> Result<ClientState, ClientError> {
        let current = self.state();
        let next = step(&current)?;
        debug!(state = %next, "Client state changed");
        self.state.send_replace(next.clone());

        if let Some(sync) = &self.sync {
            match next {
                ClientState::Connected { .. } => sync.set_link(LinkStatus::Online),
                ClientState::Disconnected { .. } | ClientState::Idle => {
                    sync.set_link(LinkStatus::Offline);
                }
                ClientState::Connecting { .. } => {}
            }
        }
        Ok(next)
    }

    fn exhaust(&self) {
        if let Some(sync) = &self.sync {
            sync.set_link(LinkStatus::Exhausted);
        }
    }

    /// Connect to `resource_id` and pump events until `outbound` closes.
    ///
    /// Inbound envelopes are forwarded to `inbound`. Lost connections are
    /// retried per the retry policy.
    ///
    /// # Errors
    ///
    /// Returns an error once the retry budget is spent or the server rejects
    /// the handshake. The state is back to idle in every case.
    pub async fn run(
        &self,
        resource_id: &str,
        mut outbound: mpsc::Receiver<ClientEvent>,
        inbound: mpsc::Sender<Envelope>,
    ) -> Result<(), SessionError> {
        self.transition(|s| s.select_resource(resource_id))?;
        let result = self.drive(resource_id, &mut outbound, &inbound).await;
        if !matches!(self.state(), ClientState::Idle) {
            self.transition(ClientState::clear_selection)?;
        }
        if result.is_err() {
            self.exhaust();
        }
        result
    }

    async fn drive(
        &self,
        resource_id: &str,
        outbound: &mut mpsc::Receiver<ClientEvent>,
        inbound: &mpsc::Sender<Envelope>,
    ) -> Result<(), SessionError> {
        loop {
            match self.connector.connect(resource_id).await {
                Ok(mut conn) => {
                    self.transition(ClientState::connection_established)?;
                    info!(resource = %resource_id, transport = self.connector.name(), "Session connected");

                    let pump = self.pump(conn.as_mut(), outbound, inbound).await;
                    if let Pump::Finished = pump {
                        if let Err(e) = conn.close().await {
                            debug!("Close failed: {}", e);
                        }
                        return Ok(());
                    }
                    warn!(resource = %resource_id, "Session connection lost");
                }
                Err(e) if e.is_terminal() => {
                    warn!(resource = %resource_id, error = %e, "Handshake rejected");
                    return Err(SessionError::Rejected(e));
                }
                Err(e) => {
                    warn!(resource = %resource_id, error = %e, "Connect attempt failed");
                }
            }

            let lost = self.transition(ClientState::connection_lost)?;
            let ClientState::Disconnected { attempt, .. } = lost else {
                return Err(ClientError::InvalidTransition {
                    state: lost.name(),
                    action: "retry",
                }
                .into());
            };

            let Some(delay) = self.config.retry.delay(attempt + 1) else {
                warn!(resource = %resource_id, attempts = attempt, "Retry budget exhausted");
                return Err(SessionError::Exhausted(attempt));
            };
            debug!(resource = %resource_id, attempt = attempt + 1, ?delay, "Reconnecting");

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = inbound.closed() => return Ok(()),
            }
            self.transition(ClientState::retry)?;
        }
    }

    async fn pump(
        &self,
        conn: &mut dyn Connection,
        outbound: &mut mpsc::Receiver<ClientEvent>,
        inbound: &mpsc::Sender<Envelope>,
    ) -> Pump {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                received = conn.recv() => match received {
                    Ok(Some(envelope)) => {
                        if inbound.send(envelope).await.is_err() {
                            return Pump::Finished;
                        }
                    }
                    Ok(None) => return Pump::Lost,
                    Err(e) => {
                        warn!("Receive failed: {}", e);
                        return Pump::Lost;
                    }
                },
                event = outbound.recv() => match event {
                    Some(event) => {
                        if let Err(e) = conn.send(event).await {
                            warn!("Send failed: {}", e);
                            return Pump::Lost;
                        }
                    }
                    None => return Pump::Finished,
                },
                _ = heartbeat.tick() => {
                    let ping = ClientEvent::HeartbeatPing { client_time: None };
                    if let Err(e) = conn.send(ping).await {
                        warn!("Heartbeat failed: {}", e);
                        return Pump::Lost;
                    }
                }
            }
        }
    }
}
