//! Classification of inbound client frames.
//!
//! The relay only reads the routing fields (`type`, `to_user`, and the voice
//! flags). Everything else in a frame is opaque and forwarded byte-for-byte.

use serde::Deserialize;

use crate::ids::{RoomId, UserId};

pub const WEBRTC_OFFER: &str = "webrtc_offer";
pub const WEBRTC_ANSWER: &str = "webrtc_answer";
pub const ICE_CANDIDATE: &str = "ice_candidate";
pub const VOICE_STATUS: &str = "voice_status";
pub const VOICE_STATUS_UPDATE: &str = "voice_status_update";
pub const LEAVE_ROOM: &str = "leave_room";

/// Why an inbound frame could not be classified.
#[derive(Debug, thiserror::Error)]
pub enum MalformedMessage {
    #[error("frame is not a JSON object with a string `type`: {0}")]
    InvalidJson(String),

    #[error("`{kind}` frame is missing `to_user`")]
    MissingTarget { kind: String },

    #[error("`{kind}` frame is missing boolean `{field}`")]
    MissingField { kind: String, field: &'static str },
}

/// A relayable signaling message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalingMessage {
    Offer { to_user: UserId },
    Answer { to_user: UserId },
    IceCandidate { to_user: UserId },
    VoiceStatus { is_speaking: bool, is_muted: bool },
    Generic { kind: String },
}

impl SignalingMessage {
    /// The single recipient for targeted messages; `None` means broadcast.
    pub fn target(&self) -> Option<&UserId> {
        match self {
            Self::Offer { to_user } | Self::Answer { to_user } | Self::IceCandidate { to_user } => {
                Some(to_user)
            }
            Self::VoiceStatus { .. } | Self::Generic { .. } => None,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Offer { .. } => WEBRTC_OFFER,
            Self::Answer { .. } => WEBRTC_ANSWER,
            Self::IceCandidate { .. } => ICE_CANDIDATE,
            Self::VoiceStatus { .. } => VOICE_STATUS,
            Self::Generic { kind } => kind,
        }
    }
}

/// Anything a connected client may send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientFrame {
    Signal(SignalingMessage),
    LeaveRoom,
}

#[derive(Deserialize)]
struct FrameHead {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    to_user: Option<String>,
    #[serde(default)]
    is_speaking: Option<bool>,
    #[serde(default)]
    is_muted: Option<bool>,
}

impl ClientFrame {
    pub fn parse(raw: &str) -> Result<Self, MalformedMessage> {
        let head: FrameHead =
            serde_json::from_str(raw).map_err(|e| MalformedMessage::InvalidJson(e.to_string()))?;

        let targeted = |build: fn(UserId) -> SignalingMessage| match head.to_user.clone() {
            Some(to) if !to.is_empty() => Ok(ClientFrame::Signal(build(UserId::from(to)))),
            _ => Err(MalformedMessage::MissingTarget {
                kind: head.kind.clone(),
            }),
        };

        match head.kind.as_str() {
            WEBRTC_OFFER => targeted(|to_user| SignalingMessage::Offer { to_user }),
            WEBRTC_ANSWER => targeted(|to_user| SignalingMessage::Answer { to_user }),
            ICE_CANDIDATE => targeted(|to_user| SignalingMessage::IceCandidate { to_user }),
            VOICE_STATUS | VOICE_STATUS_UPDATE => {
                let is_speaking = head.is_speaking.ok_or_else(|| MalformedMessage::MissingField {
                    kind: head.kind.clone(),
                    field: "is_speaking",
                })?;
                Ok(ClientFrame::Signal(SignalingMessage::VoiceStatus {
                    is_speaking,
                    is_muted: head.is_muted.unwrap_or(false),
                }))
            }
            LEAVE_ROOM => Ok(ClientFrame::LeaveRoom),
            _ => Ok(ClientFrame::Signal(SignalingMessage::Generic {
                kind: head.kind.clone(),
            })),
        }
    }
}

/// An inbound message bound to the session it arrived on.
///
/// `payload` is the exact frame text the sender produced.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub room_id: RoomId,
    pub from_user: UserId,
    pub message: SignalingMessage,
    pub payload: String,
}
