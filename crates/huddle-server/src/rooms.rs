//! Room operations that touch both the durable store and live connections.

use std::sync::Arc;

use serde_json::Value;

use huddle_core::events::RoomEvent;
use huddle_core::ids::{ConnectionId, RoomId, UserId};
use huddle_store::{JoinOutcome, LeaveOutcome, NewRoom, RoomRecord, RoomStore, StoreError};

use crate::auth::Identity;
use crate::registry::RoomRegistry;
use crate::router::{Delivery, RelayError, SignalingRouter};
use crate::settings::RoomSettings;

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("Room not found")]
    NotFound(RoomId),

    #[error("Room is full")]
    Full(RoomId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Which WebRTC message an HTTP relay carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    Offer,
    Answer,
    IceCandidate,
}

impl RelayKind {
    fn event(self, from_user: UserId, payload: Value) -> RoomEvent {
        match self {
            Self::Offer => RoomEvent::WebrtcOffer {
                from_user,
                offer: payload,
            },
            Self::Answer => RoomEvent::WebrtcAnswer {
                from_user,
                answer: payload,
            },
            Self::IceCandidate => RoomEvent::IceCandidate {
                from_user,
                candidate: payload,
            },
        }
    }
}

pub struct RoomService {
    registry: Arc<RoomRegistry>,
    router: SignalingRouter,
    store: Arc<dyn RoomStore>,
    limits: RoomSettings,
}

impl RoomService {
    pub fn new(store: Arc<dyn RoomStore>, limits: RoomSettings) -> Self {
        let registry = Arc::new(RoomRegistry::new());
        let router = SignalingRouter::new(Arc::clone(&registry), Arc::clone(&store));
        Self {
            registry,
            router,
            store,
            limits,
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &SignalingRouter {
        &self.router
    }

    pub fn store(&self) -> &Arc<dyn RoomStore> {
        &self.store
    }

    pub fn default_max_users(&self) -> u32 {
        self.limits.default_max_users
    }

    /// Create a room with `creator` as its first participant.
    /// Capacity is clamped to `1..=max_users_limit`.
    pub async fn create_room(
        &self,
        mut room: NewRoom,
        creator: &Identity,
    ) -> Result<RoomRecord, RoomError> {
        room.max_users = room.max_users.clamp(1, self.limits.max_users_limit.max(1));
        let record = self.store.create_room(room, creator.user_id.clone()).await?;
        tracing::info!(
            room_id = %record.id,
            created_by = %record.created_by,
            max_users = record.max_users,
            "Room created"
        );
        Ok(record)
    }

    pub async fn list_rooms(&self) -> Result<Vec<RoomRecord>, RoomError> {
        Ok(self.store.list_rooms().await?)
    }

    pub async fn get_room(&self, room_id: &RoomId) -> Result<RoomRecord, RoomError> {
        self.store
            .get_room(room_id)
            .await?
            .ok_or_else(|| RoomError::NotFound(room_id.clone()))
    }

    /// Add the caller to the room and tell everyone else.
    pub async fn join(&self, room_id: &RoomId, identity: &Identity) -> Result<JoinOutcome, RoomError> {
        let outcome = self.store.join(room_id, &identity.user_id).await?;
        match outcome {
            JoinOutcome::NotFound => return Err(RoomError::NotFound(room_id.clone())),
            JoinOutcome::Full => return Err(RoomError::Full(room_id.clone())),
            JoinOutcome::Joined | JoinOutcome::AlreadyMember => {}
        }

        tracing::info!(room_id = %room_id, user_id = %identity.user_id, ?outcome, "User joined room");
        self.router.publish(
            room_id,
            &RoomEvent::UserJoined {
                user: identity.summary(),
                room_id: room_id.clone(),
            },
            Some(&identity.user_id),
        );
        Ok(outcome)
    }

    /// Remove `user` from the room entirely.
    ///
    /// Drops the participant and speaker rows, closes any live connection,
    /// notifies the remaining members, and deletes the room once nobody is
    /// left. Returns the remaining participant count.
    pub async fn leave(&self, room_id: &RoomId, user: &UserId) -> Result<usize, RoomError> {
        let remaining = match self.store.leave(room_id, user).await? {
            LeaveOutcome::NotFound => return Err(RoomError::NotFound(room_id.clone())),
            LeaveOutcome::Left { remaining, .. } => remaining,
        };

        if let Some(handle) = self.registry.unregister(room_id, user) {
            handle.close();
        }

        tracing::info!(room_id = %room_id, user_id = %user, remaining, "User left room");
        self.router.publish(
            room_id,
            &RoomEvent::UserLeft {
                user_id: user.clone(),
                room_id: room_id.clone(),
            },
            None,
        );

        if remaining == 0 {
            if let Err(err) = self.store.delete_room(room_id).await {
                tracing::warn!(room_id = %room_id, error = %err, "Failed to delete empty room");
            } else {
                tracing::info!(room_id = %room_id, "Deleted empty room");
            }
        }
        Ok(remaining)
    }

    /// Handle the transport of `connection` going away.
    ///
    /// Notifies the room only if that connection was still the registered
    /// one for the user.
    pub fn disconnected(&self, room_id: &RoomId, user: &UserId, connection: &ConnectionId) -> bool {
        if !self.registry.unregister_connection(room_id, user, connection) {
            return false;
        }
        self.router.publish(
            room_id,
            &RoomEvent::UserDisconnected {
                user_id: user.clone(),
            },
            None,
        );
        true
    }

    /// Relay a WebRTC payload submitted over HTTP to one connected user.
    ///
    /// A recipient that is not connected is not an error.
    pub fn relay(
        &self,
        kind: RelayKind,
        room_id: &RoomId,
        from: &Identity,
        to_user: &UserId,
        payload: Value,
    ) -> Delivery {
        let event = kind.event(from.user_id.clone(), payload);
        match self.router.notify(room_id, to_user, &event) {
            Ok(()) => Delivery {
                delivered: 1,
                failed: 0,
            },
            Err(RelayError::RecipientNotConnected { .. }) => {
                tracing::debug!(room_id = %room_id, to_user = %to_user, kind = event.kind(), "Recipient not connected");
                Delivery::default()
            }
            Err(err) => {
                tracing::warn!(room_id = %room_id, error = %err, "HTTP relay failed");
                Delivery {
                    delivered: 0,
                    failed: 1,
                }
            }
        }
    }

    /// Record a speaking/muted change and announce it to everyone but `caller`.
    pub async fn voice_status(
        &self,
        room_id: &RoomId,
        caller: &UserId,
        subject: &UserId,
        is_speaking: bool,
        is_muted: bool,
    ) -> Delivery {
        self.router.update_speaker(room_id, subject, is_speaking).await;
        self.router.publish(
            room_id,
            &RoomEvent::VoiceStatusUpdate {
                user_id: subject.clone(),
                is_speaking,
                is_muted,
            },
            Some(caller),
        )
    }
}
