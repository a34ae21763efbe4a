//! # tessera-protocol
//!
//! Wire protocol definitions for the Tessera realtime sync engine.
//!
//! Every message on a realtime connection is an [`Envelope`]: a named event
//! carrying a JSON payload. Inbound envelopes are validated into
//! [`ClientEvent`]s; the server answers with [`ServerEvent`]s.
//!
//! ## Events
//!
//! - `view-update` / `item-update` - controller-authored mutations
//! - `request-sync` / `sync-response` - late-joiner state handshake
//! - `heartbeat-ping` - liveness check answered only to the sender
//!
//! ## Example
//!
//! ```rust
//! use tessera_protocol::{codec, ClientEvent, Envelope};
//!
//! let envelope: Envelope = codec::decode_text(r#"{"event":"item-update","payload":{"x":1}}"#).unwrap();
//! let event = ClientEvent::from_envelope(envelope).unwrap();
//! assert!(matches!(event, Some(ClientEvent::ItemUpdate(_))));
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode, decode_text, encode, encode_text, ProtocolError};
pub use events::{ClientEvent, Envelope, EventKind, Role, ServerEvent};
