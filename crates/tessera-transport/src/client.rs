//! Client connection state machine and reconnect policy.

use std::fmt;
use std::time::Duration;
use tessera_core::ResourceId;
use thiserror::Error;

/// Client state machine errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The action is not valid in the current state.
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        state: &'static str,
        action: &'static str,
    },
}

/// Connection state for the selected resource.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ClientState {
    /// No resource selected.
    #[default]
    Idle,
    /// Handshake in progress. `attempt` is 0 for the first try.
    Connecting { resource_id: ResourceId, attempt: u32 },
    /// Admitted and exchanging events.
    Connected { resource_id: ResourceId },
    /// Connection lost after `attempt` retries.
    Disconnected { resource_id: ResourceId, attempt: u32 },
}

impl ClientState {
    /// Short state name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientState::Idle => "idle",
            ClientState::Connecting { .. } => "connecting",
            ClientState::Connected { .. } => "connected",
            ClientState::Disconnected { .. } => "disconnected",
        }
    }

    /// The selected resource, if any.
    #[must_use]
    pub fn resource_id(&self) -> Option<&str> {
        match self {
            ClientState::Idle => None,
            ClientState::Connecting { resource_id, .. }
            | ClientState::Connected { resource_id }
            | ClientState::Disconnected { resource_id, .. } => Some(resource_id),
        }
    }

    /// Check if the client is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, ClientState::Connected { .. })
    }

    fn invalid(&self, action: &'static str) -> ClientError {
        ClientError::InvalidTransition {
            state: self.name(),
            action,
        }
    }

    /// `Idle → Connecting`.
    ///
    /// # Errors
    ///
    /// Fails unless idle; clear the current selection first.
    pub fn select_resource(&self, resource_id: impl Into<ResourceId>) -> Result<Self, ClientError> {
        match self {
            ClientState::Idle => Ok(ClientState::Connecting {
                resource_id: resource_id.into(),
                attempt: 0,
            }),
            _ => Err(self.invalid("select a resource")),
        }
    }

    /// `Connecting → Connected`.
    ///
    /// # Errors
    ///
    /// Fails unless connecting.
    pub fn connection_established(&self) -> Result<Self, ClientError> {
        match self {
            ClientState::Connecting { resource_id, .. } => Ok(ClientState::Connected {
                resource_id: resource_id.clone(),
            }),
            _ => Err(self.invalid("establish a connection")),
        }
    }

    /// `Connecting | Connected → Disconnected`.
    ///
    /// # Errors
    ///
    /// Fails when idle or already disconnected.
    pub fn connection_lost(&self) -> Result<Self, ClientError> {
        match self {
            ClientState::Connecting {
                resource_id,
                attempt,
            } => Ok(ClientState::Disconnected {
                resource_id: resource_id.clone(),
                attempt: *attempt,
            }),
            ClientState::Connected { resource_id } => Ok(ClientState::Disconnected {
                resource_id: resource_id.clone(),
                attempt: 0,
            }),
            _ => Err(self.invalid("lose the connection")),
        }
    }

    /// `Disconnected → Connecting`, counting one more attempt.
    ///
    /// # Errors
    ///
    /// Fails unless disconnected.
    pub fn retry(&self) -> Result<Self, ClientError> {
        match self {
            ClientState::Disconnected {
                resource_id,
                attempt,
            } => Ok(ClientState::Connecting {
                resource_id: resource_id.clone(),
                attempt: attempt + 1,
            }),
            _ => Err(self.invalid("retry")),
        }
    }

    /// `* → Idle`.
    ///
    /// # Errors
    ///
    /// Fails when already idle.
    pub fn clear_selection(&self) -> Result<Self, ClientError> {
        match self {
            ClientState::Idle => Err(self.invalid("clear the selection")),
            _ => Ok(ClientState::Idle),
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resource_id() {
            Some(id) => write!(f, "{} ({})", self.name(), id),
            None => f.write_str(self.name()),
        }
    }
}

/// Exponential backoff with a retry budget.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor between retries.
    pub multiplier: u32,
    /// Retries allowed per outage. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
            max_retries: Some(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    ///
    /// Returns `None` once the budget is spent.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || self.max_retries.is_some_and(|max| attempt > max) {
            return None;
        }
        let factor = self.multiplier.saturating_pow(attempt - 1);
        Some(self.initial_delay.saturating_mul(factor).min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let state = ClientState::Idle.select_resource("42").unwrap();
        assert_eq!(
            state,
            ClientState::Connecting {
                resource_id: "42".into(),
                attempt: 0
            }
        );

        let state = state.connection_established().unwrap();
        assert!(state.is_connected());
        assert_eq!(state.resource_id(), Some("42"));

        let state = state.clear_selection().unwrap();
        assert_eq!(state, ClientState::Idle);
    }

    #[test]
    fn test_reconnect_cycle_counts_attempts() {
        let state = ClientState::Connected {
            resource_id: "42".into(),
        };

        let state = state.connection_lost().unwrap();
        assert_eq!(
            state,
            ClientState::Disconnected {
                resource_id: "42".into(),
                attempt: 0
            }
        );

        let state = state.retry().unwrap().connection_lost().unwrap();
        let state = state.retry().unwrap();
        assert_eq!(
            state,
            ClientState::Connecting {
                resource_id: "42".into(),
                attempt: 2
            }
        );

        // A successful reconnect resets the count.
        let state = state.connection_established().unwrap().connection_lost().unwrap();
        assert!(matches!(state, ClientState::Disconnected { attempt: 0, .. }));
    }

    #[test]
    fn test_invalid_transitions() {
        let idle = ClientState::Idle;
        assert!(idle.connection_established().is_err());
        assert!(idle.connection_lost().is_err());
        assert!(idle.retry().is_err());
        assert!(idle.clear_selection().is_err());

        let connected = ClientState::Connected {
            resource_id: "42".into(),
        };
        assert_eq!(
            connected.select_resource("7"),
            Err(ClientError::InvalidTransition {
                state: "connected",
                action: "select a resource"
            })
        );
        assert!(connected.retry().is_err());

        let disconnected = connected.connection_lost().unwrap();
        assert!(disconnected.connection_lost().is_err());
        assert!(disconnected.connection_established().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(ClientState::Idle.to_string(), "idle");
        let state = ClientState::Connected {
            resource_id: "42".into(),
        };
        assert_eq!(state.to_string(), "connected (42)");
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2,
            max_retries: Some(5),
        };

        assert_eq!(policy.delay(0), None);
        assert_eq!(policy.delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay(3), Some(Duration::from_millis(400)));
        assert_eq!(policy.delay(4), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay(5), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay(6), None);
    }

    #[test]
    fn test_unbounded_budget() {
        let policy = RetryPolicy {
            max_retries: None,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay(1_000), Some(policy.max_delay));
    }
}
