//! Room presence and WebRTC signaling relay.
//!
//! Clients hold one WebSocket per (room, user). The [`registry`] tracks which
//! connections are live, [`session`] drives each connection, and [`router`]
//! forwards signaling frames between them. Durable room state lives behind
//! [`huddle_store::RoomStore`].

pub mod api;
pub mod auth;
pub mod peer;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod server;
pub mod session;
pub mod settings;

pub use auth::{AuthError, Identity, TokenVerifier};
pub use peer::{PeerHandle, SendError};
pub use registry::RoomRegistry;
pub use rooms::{RelayKind, RoomError, RoomService};
pub use router::{Delivery, RelayError, SignalingRouter};
pub use server::{build_router, start, AppState, ServerHandle};
pub use session::{CloseReason, Session, SessionConfig, SessionState};
pub use settings::{HuddleSettings, SettingsError};
