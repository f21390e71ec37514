//! Shared identifiers and wire types for the huddle relay.

pub mod events;
pub mod ids;
pub mod signaling;

pub use events::{RoomEvent, UserSummary};
pub use ids::{ConnectionId, RoomId, UserId};
pub use signaling::{ClientFrame, Envelope, MalformedMessage, SignalingMessage};
