use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{RoomId, UserId};

/// Public view of a user, as announced to room members.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Frames the server itself originates and pushes to connected members.
///
/// Client-originated frames are relayed verbatim and never pass through this
/// type; only notifications and relays submitted over HTTP are built here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RoomEvent {
    #[serde(rename = "user_joined")]
    UserJoined { user: UserSummary, room_id: RoomId },

    #[serde(rename = "user_left")]
    UserLeft { user_id: UserId, room_id: RoomId },

    #[serde(rename = "user_disconnected")]
    UserDisconnected { user_id: UserId },

    #[serde(rename = "webrtc_offer")]
    WebrtcOffer { from_user: UserId, offer: Value },

    #[serde(rename = "webrtc_answer")]
    WebrtcAnswer { from_user: UserId, answer: Value },

    #[serde(rename = "ice_candidate")]
    IceCandidate { from_user: UserId, candidate: Value },

    #[serde(rename = "voice_status_update")]
    VoiceStatusUpdate {
        user_id: UserId,
        is_speaking: bool,
        is_muted: bool,
    },
}

impl RoomEvent {
    /// Wire name of the event (the `type` field).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::UserDisconnected { .. } => "user_disconnected",
            Self::WebrtcOffer { .. } => "webrtc_offer",
            Self::WebrtcAnswer { .. } => "webrtc_answer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::VoiceStatusUpdate { .. } => "voice_status_update",
        }
    }

    /// Serialize to a text frame.
    pub fn to_frame(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}
