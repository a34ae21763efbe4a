//! Role-gated event routing.
//!
//! Every inbound envelope is validated into a [`ClientEvent`] and checked
//! against the role gate before anything is broadcast. Errors go back to the
//! sender only and never touch shared state.
//!
//! | event          | required role | effect                                   |
//! |----------------|---------------|------------------------------------------|
//! | view-update    | controller    | `view-updated` to the room, minus sender  |
//! | item-update    | controller    | `item-updated` to the room, minus sender  |
//! | request-sync   | viewer        | `sync-requested` to controllers           |
//! | sync-response  | controller    | `sync-response` to the room, minus sender |
//! | heartbeat-ping | any           | `heartbeat-pong` to the sender only       |

use crate::connection::{now_millis, ConnectionId};
use crate::presence::PresenceTracker;
use crate::registry::{BroadcastReport, RoomRegistry};
use serde_json::Value;
use std::sync::Arc;
use tessera_protocol::{ClientEvent, Envelope, EventKind, Role, ServerEvent};
use tracing::{debug, trace, warn};

/// Role required to send an event. `None` means any role.
#[must_use]
pub fn required_role(kind: EventKind) -> Option<Role> {
    match kind {
        EventKind::ViewUpdate | EventKind::ItemUpdate | EventKind::SyncResponse => {
            Some(Role::Controller)
        }
        EventKind::RequestSync => Some(Role::Viewer),
        EventKind::HeartbeatPing => None,
    }
}

/// What the router did with an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Relayed to the room.
    Broadcast {
        event: EventKind,
        report: BroadcastReport,
    },
    /// Answered to the sender only.
    Replied,
    /// Sender's role does not allow this event.
    Denied { event: EventKind, required: Role },
    /// Known event with a malformed payload.
    Rejected { reason: String },
    /// Unknown event name.
    Ignored,
    /// Sender is not a tracked connection.
    UnknownConnection,
}

/// Validates, gates and dispatches client events.
#[derive(Clone)]
pub struct EventRouter {
    registry: Arc<RoomRegistry>,
    presence: Arc<PresenceTracker>,
}

impl EventRouter {
    /// Create a router over a registry and a presence tracker.
    #[must_use]
    pub fn new(registry: Arc<RoomRegistry>, presence: Arc<PresenceTracker>) -> Self {
        Self { registry, presence }
    }

    /// Route one envelope sent by `connection_id`.
    pub fn route(&self, connection_id: &ConnectionId, envelope: Envelope) -> RouteOutcome {
        let Some(conn) = self.presence.get(connection_id) else {
            warn!(connection = %connection_id, "Event from unknown connection");
            return RouteOutcome::UnknownConnection;
        };
        let resource = conn.resource_id.as_str();
        if !self.registry.is_member(resource, connection_id) {
            warn!(connection = %connection_id, resource = %resource, "Event from evicted connection");
            return RouteOutcome::UnknownConnection;
        }
        let name = envelope.event.clone();

        let event = match ClientEvent::from_envelope(envelope) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(connection = %conn.id, event = %name, "Ignoring unknown event");
                return RouteOutcome::Ignored;
            }
            Err(e) => {
                let reason = e.to_string();
                self.registry
                    .send_to(resource, &conn.id, ServerEvent::error(reason.clone()));
                return RouteOutcome::Rejected { reason };
            }
        };

        let kind = event.kind();
        if let Some(required) = required_role(kind) {
            if conn.role != required {
                debug!(
                    connection = %conn.id,
                    event = %kind,
                    role = %conn.role,
                    "Permission denied"
                );
                self.registry.send_to(
                    resource,
                    &conn.id,
                    ServerEvent::error(format!(
                        "permission denied: {kind} requires the {required} role"
                    )),
                );
                return RouteOutcome::Denied {
                    event: kind,
                    required,
                };
            }
        }

        let report = match event {
            ClientEvent::ViewUpdate(map) => self.registry.broadcast(
                resource,
                ServerEvent::ViewUpdated(Value::Object(map)),
                Some(conn.id),
            ),
            ClientEvent::ItemUpdate(map) => self.registry.broadcast(
                resource,
                ServerEvent::ItemUpdated(Value::Object(map)),
                Some(conn.id),
            ),
            ClientEvent::RequestSync => self.registry.broadcast_to_role(
                resource,
                ServerEvent::SyncRequested {
                    from: conn.user_id.clone(),
                },
                Role::Controller,
                Some(conn.id),
            ),
            ClientEvent::SyncResponse { state } => self.registry.broadcast(
                resource,
                ServerEvent::SyncResponse { state },
                Some(conn.id),
            ),
            ClientEvent::HeartbeatPing { client_time } => {
                self.presence.touch(&conn.id);
                self.registry.send_to(
                    resource,
                    &conn.id,
                    ServerEvent::HeartbeatPong {
                        server_time: now_millis(),
                        client_time,
                    },
                );
                return RouteOutcome::Replied;
            }
        };

        trace!(
            connection = %conn.id,
            event = %kind,
            delivered = report.delivered,
            "Routed event"
        );
        RouteOutcome::Broadcast {
            event: kind,
            report,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::message::{outbox, Inbox};
    use serde_json::json;

    struct Fixture {
        registry: Arc<RoomRegistry>,
        presence: Arc<PresenceTracker>,
        router: EventRouter,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(RoomRegistry::new());
            let presence = Arc::new(PresenceTracker::new());
            let router = EventRouter::new(registry.clone(), presence.clone());
            Self {
                registry,
                presence,
                router,
            }
        }

        fn connect(&self, user: &str, role: Role) -> (Connection, Inbox) {
            let conn = Connection::new("42", user, role);
            let (tx, rx) = outbox(16);
            self.presence.record(conn.clone());
            self.registry.join("42", conn.id, role, tx).unwrap();
            (conn, rx)
        }
    }

    fn drain(rx: &mut Inbox) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg.envelope.clone());
        }
        out
    }

    #[test]
    fn test_role_table() {
        assert_eq!(required_role(EventKind::ViewUpdate), Some(Role::Controller));
        assert_eq!(required_role(EventKind::ItemUpdate), Some(Role::Controller));
        assert_eq!(required_role(EventKind::RequestSync), Some(Role::Viewer));
        assert_eq!(required_role(EventKind::SyncResponse), Some(Role::Controller));
        assert_eq!(required_role(EventKind::HeartbeatPing), None);
    }

    #[test]
    fn test_item_update_reaches_everyone_but_sender() {
        let fx = Fixture::new();
        let (controller, mut controller_rx) = fx.connect("gm", Role::Controller);
        let (_, mut viewer_rx) = fx.connect("v", Role::Viewer);
        let (_, mut other_rx) = fx.connect("gm2", Role::Controller);

        let outcome = fx
            .router
            .route(&controller.id, Envelope::new("item-update", json!({"x": 1})));
        assert!(matches!(
            outcome,
            RouteOutcome::Broadcast { event: EventKind::ItemUpdate, ref report } if report.delivered == 2
        ));

        assert!(drain(&mut controller_rx).is_empty());
        for rx in [&mut viewer_rx, &mut other_rx] {
            assert_eq!(
                drain(rx),
                vec![Envelope::new("item-updated", json!({"x": 1}))]
            );
        }
    }

    #[test]
    fn test_viewer_cannot_update_view() {
        let fx = Fixture::new();
        let (viewer, mut viewer_rx) = fx.connect("v", Role::Viewer);
        let (_, mut controller_rx) = fx.connect("gm", Role::Controller);

        let outcome = fx
            .router
            .route(&viewer.id, Envelope::new("view-update", json!({"zoom": 2})));
        assert_eq!(
            outcome,
            RouteOutcome::Denied {
                event: EventKind::ViewUpdate,
                required: Role::Controller
            }
        );

        let replies = drain(&mut viewer_rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].event, "error");
        assert!(drain(&mut controller_rx).is_empty());
        assert_eq!(fx.registry.room_size("42"), 2);
        assert!(fx.registry.is_member("42", &viewer.id));
    }

    #[test]
    fn test_controller_cannot_request_sync() {
        let fx = Fixture::new();
        let (controller, mut controller_rx) = fx.connect("gm", Role::Controller);
        let (_, mut viewer_rx) = fx.connect("v", Role::Viewer);

        let outcome = fx
            .router
            .route(&controller.id, Envelope::new("request-sync", Value::Null));
        assert!(matches!(outcome, RouteOutcome::Denied { required: Role::Viewer, .. }));
        assert_eq!(drain(&mut controller_rx)[0].event, "error");
        assert!(drain(&mut viewer_rx).is_empty());
    }

    #[test]
    fn test_sync_handshake() {
        let fx = Fixture::new();
        let (viewer, mut viewer_rx) = fx.connect("V", Role::Viewer);
        let (_, mut bystander_rx) = fx.connect("W", Role::Viewer);
        let (controller, mut controller_rx) = fx.connect("gm", Role::Controller);

        fx.router
            .route(&viewer.id, Envelope::new("request-sync", Value::Null));
        assert_eq!(
            drain(&mut controller_rx),
            vec![Envelope::new("sync-requested", json!({"from": "V"}))]
        );
        assert!(drain(&mut bystander_rx).is_empty());
        assert!(drain(&mut viewer_rx).is_empty());

        let state = json!({"state": {"screen": "map", "zoom": 3}});
        fx.router
            .route(&controller.id, Envelope::new("sync-response", state.clone()));
        assert_eq!(
            drain(&mut viewer_rx),
            vec![Envelope::new("sync-response", state.clone())]
        );
        assert_eq!(
            drain(&mut bystander_rx),
            vec![Envelope::new("sync-response", state)]
        );
        assert!(drain(&mut controller_rx).is_empty());
    }

    #[test]
    fn test_heartbeat_replies_to_sender_only() {
        let fx = Fixture::new();
        let (viewer, mut viewer_rx) = fx.connect("v", Role::Viewer);
        let (_, mut controller_rx) = fx.connect("gm", Role::Controller);

        let outcome = fx.router.route(
            &viewer.id,
            Envelope::new("heartbeat-ping", json!({"clientTime": 5})),
        );
        assert_eq!(outcome, RouteOutcome::Replied);

        let replies = drain(&mut viewer_rx);
        assert_eq!(replies.len(), 1);
        match ServerEvent::from_envelope(replies[0].clone()) {
            Some(ServerEvent::HeartbeatPong {
                server_time,
                client_time,
            }) => {
                assert!(server_time > 0);
                assert_eq!(client_time, Some(5));
            }
            other => panic!("Expected heartbeat-pong, got {:?}", other),
        }
        assert!(drain(&mut controller_rx).is_empty());
    }

    #[test]
    fn test_unknown_event_is_ignored() {
        let fx = Fixture::new();
        let (controller, mut controller_rx) = fx.connect("gm", Role::Controller);
        let (_, mut viewer_rx) = fx.connect("v", Role::Viewer);

        let outcome = fx
            .router
            .route(&controller.id, Envelope::new("roll-dice", json!({"d": 20})));
        assert_eq!(outcome, RouteOutcome::Ignored);
        assert!(drain(&mut controller_rx).is_empty());
        assert!(drain(&mut viewer_rx).is_empty());
    }

    #[test]
    fn test_malformed_payload_is_rejected_to_sender() {
        let fx = Fixture::new();
        let (controller, mut controller_rx) = fx.connect("gm", Role::Controller);
        let (_, mut viewer_rx) = fx.connect("v", Role::Viewer);

        let outcome = fx
            .router
            .route(&controller.id, Envelope::new("item-update", json!("x=1")));
        assert!(matches!(outcome, RouteOutcome::Rejected { .. }));
        assert_eq!(drain(&mut controller_rx)[0].event, "error");
        assert!(drain(&mut viewer_rx).is_empty());
    }

    #[test]
    fn test_unknown_connection() {
        let fx = Fixture::new();
        let outcome = fx.router.route(
            &ConnectionId::generate(),
            Envelope::new("item-update", json!({})),
        );
        assert_eq!(outcome, RouteOutcome::UnknownConnection);
    }

    #[test]
    fn test_evicted_member_cannot_route() {
        let fx = Fixture::new();
        let (controller, mut controller_rx) = fx.connect("alice", Role::Controller);
        let (viewer, viewer_rx) = fx.connect("bob", Role::Viewer);

        // The viewer's socket task is gone; the next broadcast evicts it.
        drop(viewer_rx);
        let outcome = fx
            .router
            .route(&controller.id, Envelope::new("item-update", json!({"id": 1})));
        let RouteOutcome::Broadcast { report, .. } = outcome else {
            panic!("expected a broadcast, got {outcome:?}");
        };
        assert_eq!(report.evicted, vec![viewer.id]);
        assert!(fx.presence.get(&viewer.id).is_some());

        let outcome = fx
            .router
            .route(&viewer.id, Envelope::new("request-sync", Value::Null));
        assert_eq!(outcome, RouteOutcome::UnknownConnection);
        assert!(drain(&mut controller_rx).is_empty());
    }
}
