//! Signaling relay.
//!
//! Targeted frames (offer, answer, ICE) go to exactly one peer; everything else
//! fans out to the rest of the room. Client frames are forwarded as the exact
//! text the sender produced.

use std::sync::Arc;

use huddle_core::events::RoomEvent;
use huddle_core::ids::{RoomId, UserId};
use huddle_core::signaling::{Envelope, SignalingMessage};
use huddle_store::RoomStore;

use crate::peer::SendError;
use crate::registry::RoomRegistry;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{user} is not connected to {room}")]
    RecipientNotConnected { room: RoomId, user: UserId },

    #[error("send to {user} failed: {source}")]
    SendFailure {
        user: UserId,
        #[source]
        source: SendError,
    },
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

pub struct SignalingRouter {
    registry: Arc<RoomRegistry>,
    store: Arc<dyn RoomStore>,
}

impl SignalingRouter {
    pub fn new(registry: Arc<RoomRegistry>, store: Arc<dyn RoomStore>) -> Self {
        Self { registry, store }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Relay one inbound client frame.
    pub async fn route(&self, envelope: Envelope) -> Delivery {
        let Envelope {
            room_id,
            from_user,
            message,
            payload,
        } = envelope;

        if let Some(to_user) = message.target() {
            return match self.send_to(&room_id, to_user, payload) {
                Ok(()) => Delivery {
                    delivered: 1,
                    failed: 0,
                },
                Err(RelayError::RecipientNotConnected { .. }) => {
                    tracing::debug!(
                        room_id = %room_id,
                        from_user = %from_user,
                        to_user = %to_user,
                        kind = message.kind(),
                        "Recipient not connected, dropping frame"
                    );
                    Delivery::default()
                }
                Err(err) => {
                    tracing::warn!(room_id = %room_id, error = %err, "Targeted relay failed");
                    Delivery {
                        delivered: 0,
                        failed: 1,
                    }
                }
            };
        }

        if let SignalingMessage::VoiceStatus { is_speaking, .. } = message {
            self.update_speaker(&room_id, &from_user, is_speaking).await;
        }
        self.broadcast(&room_id, &payload, Some(&from_user))
    }

    /// Queue `frame` for one connected user.
    pub fn send_to(&self, room: &RoomId, user: &UserId, frame: String) -> Result<(), RelayError> {
        let peer = self
            .registry
            .lookup(room, user)
            .ok_or_else(|| RelayError::RecipientNotConnected {
                room: room.clone(),
                user: user.clone(),
            })?;
        peer.send(frame).map_err(|source| RelayError::SendFailure {
            user: user.clone(),
            source,
        })
    }

    /// Queue `frame` for every connected member except `exclude`.
    ///
    /// A failed send is logged and skipped; it never stops the fan-out.
    pub fn broadcast(&self, room: &RoomId, frame: &str, exclude: Option<&UserId>) -> Delivery {
        let mut delivery = Delivery::default();
        for peer in self.registry.recipients(room, exclude) {
            match peer.send(frame.to_owned()) {
                Ok(()) => delivery.delivered += 1,
                Err(err) => {
                    delivery.failed += 1;
                    tracing::warn!(
                        room_id = %room,
                        user_id = %peer.user_id(),
                        connection_id = %peer.connection_id(),
                        error = %err,
                        "Broadcast send failed, skipping recipient"
                    );
                }
            }
        }
        delivery
    }

    /// Serialize a server event and broadcast it.
    pub fn publish(&self, room: &RoomId, event: &RoomEvent, exclude: Option<&UserId>) -> Delivery {
        match event.to_frame() {
            Some(frame) => {
                let delivery = self.broadcast(room, &frame, exclude);
                tracing::debug!(
                    room_id = %room,
                    event = event.kind(),
                    delivered = delivery.delivered,
                    failed = delivery.failed,
                    "Published room event"
                );
                delivery
            }
            None => {
                tracing::error!(room_id = %room, event = event.kind(), "Failed to serialize room event");
                Delivery::default()
            }
        }
    }

    /// Serialize a server event and send it to one user.
    pub fn notify(&self, room: &RoomId, user: &UserId, event: &RoomEvent) -> Result<(), RelayError> {
        match event.to_frame() {
            Some(frame) => self.send_to(room, user, frame),
            None => {
                tracing::error!(room_id = %room, event = event.kind(), "Failed to serialize room event");
                Ok(())
            }
        }
    }

    /// Record speaking state in the store. Failures are logged only.
    pub async fn update_speaker(&self, room: &RoomId, user: &UserId, speaking: bool) {
        if let Err(err) = self.store.set_active_speaker(room, user, speaking).await {
            tracing::warn!(
                room_id = %room,
                user_id = %user,
                speaking,
                error = %err,
                "Active speaker update failed"
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use async_trait::async_trait;
    use huddle_core::signaling::ClientFrame;
    use huddle_store::{
        Database, JoinOutcome, LeaveOutcome, NewRoom, RoomRecord, SqliteRoomStore, StoreError,
    };
    use tokio::sync::mpsc;

    use super::*;
    use crate::peer::PeerHandle;

    /// Store whose every call fails.
    pub(crate) struct FailingStore;

    #[async_trait]
    impl RoomStore for FailingStore {
        async fn create_room(&self, _: NewRoom, _: UserId) -> Result<RoomRecord, StoreError> {
            Err(StoreError::Database("down".into()))
        }
        async fn list_rooms(&self) -> Result<Vec<RoomRecord>, StoreError> {
            Err(StoreError::Database("down".into()))
        }
        async fn get_room(&self, _: &RoomId) -> Result<Option<RoomRecord>, StoreError> {
            Err(StoreError::Database("down".into()))
        }
        async fn join(&self, _: &RoomId, _: &UserId) -> Result<JoinOutcome, StoreError> {
            Err(StoreError::Database("down".into()))
        }
        async fn leave(&self, _: &RoomId, _: &UserId) -> Result<LeaveOutcome, StoreError> {
            Err(StoreError::Database("down".into()))
        }
        async fn delete_room(&self, _: &RoomId) -> Result<bool, StoreError> {
            Err(StoreError::Database("down".into()))
        }
        async fn set_active_speaker(&self, _: &RoomId, _: &UserId, _: bool) -> Result<(), StoreError> {
            Err(StoreError::Database("down".into()))
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Database("down".into()))
        }
    }

    fn sqlite() -> Arc<dyn RoomStore> {
        Arc::new(SqliteRoomStore::new(Database::in_memory().unwrap()))
    }

    struct Fixture {
        router: SignalingRouter,
        room: RoomId,
        rx: Vec<(UserId, mpsc::Receiver<String>)>,
    }

    fn fixture(store: Arc<dyn RoomStore>, users: &[&str]) -> Fixture {
        let registry = Arc::new(RoomRegistry::new());
        let room = RoomId::from("r1");
        let mut rx = Vec::new();
        for name in users {
            let user = UserId::from(*name);
            let (handle, receiver) = PeerHandle::channel(user.clone(), 8);
            registry.register(&room, &user, handle);
            rx.push((user, receiver));
        }
        Fixture {
            router: SignalingRouter::new(registry, store),
            room,
            rx,
        }
    }

    fn envelope(room: &RoomId, from: &str, raw: &str) -> Envelope {
        let ClientFrame::Signal(message) = ClientFrame::parse(raw).unwrap() else {
            panic!("not a signal frame: {raw}");
        };
        Envelope {
            room_id: room.clone(),
            from_user: UserId::from(from),
            message,
            payload: raw.to_string(),
        }
    }

    #[tokio::test]
    async fn offer_reaches_only_target_verbatim() {
        let mut f = fixture(sqlite(), &["a", "b", "c"]);
        let raw = r#"{"type":"webrtc_offer","to_user":"b","offer":{"sdp":"v=0 "}}"#;

        let delivery = f.router.route(envelope(&f.room, "a", raw)).await;
        assert_eq!(delivery.delivered, 1);

        assert!(f.rx[0].1.try_recv().is_err());
        assert_eq!(f.rx[1].1.try_recv().unwrap(), raw);
        assert!(f.rx[2].1.try_recv().is_err());
    }

    #[tokio::test]
    async fn targeted_to_absent_user_is_silent() {
        let mut f = fixture(sqlite(), &["a", "b"]);
        let raw = r#"{"type":"ice_candidate","to_user":"zed","candidate":{}}"#;

        let delivery = f.router.route(envelope(&f.room, "a", raw)).await;
        assert_eq!(delivery, Delivery::default());
        assert!(f.rx[1].1.try_recv().is_err());
    }

    #[tokio::test]
    async fn generic_frames_skip_sender() {
        let mut f = fixture(sqlite(), &["a", "b", "c"]);
        let raw = r#"{"type":"chat","text":"hi"}"#;

        let delivery = f.router.route(envelope(&f.room, "b", raw)).await;
        assert_eq!(delivery.delivered, 2);
        assert_eq!(f.rx[0].1.try_recv().unwrap(), raw);
        assert!(f.rx[1].1.try_recv().is_err());
        assert_eq!(f.rx[2].1.try_recv().unwrap(), raw);
    }

    #[tokio::test]
    async fn failed_recipient_does_not_stop_fanout() {
        let mut f = fixture(sqlite(), &["a", "b", "c"]);
        // Drop b's receiver so its sends fail.
        let (_, b_rx) = f.rx.remove(1);
        drop(b_rx);

        let delivery = f.router.broadcast(&f.room, "x", Some(&UserId::from("a")));
        assert_eq!(
            delivery,
            Delivery {
                delivered: 1,
                failed: 1
            }
        );
        assert_eq!(f.rx[1].1.try_recv().unwrap(), "x");
    }

    #[tokio::test]
    async fn send_to_reports_missing_recipient() {
        let f = fixture(sqlite(), &["a"]);
        let err = f
            .router
            .send_to(&f.room, &UserId::from("ghost"), "x".into())
            .unwrap_err();
        assert!(matches!(err, RelayError::RecipientNotConnected { .. }));
    }

    #[tokio::test]
    async fn voice_status_updates_speakers_then_broadcasts() {
        let store = sqlite();
        let room = store
            .create_room(
                NewRoom {
                    name: None,
                    language: "en".into(),
                    level: "any".into(),
                    max_users: 8,
                    is_private: false,
                },
                UserId::from("a"),
            )
            .await
            .unwrap();
        store.join(&room.id, &UserId::from("b")).await.unwrap();

        let registry = Arc::new(RoomRegistry::new());
        let (a, _a_rx) = PeerHandle::channel(UserId::from("a"), 8);
        let (b, mut b_rx) = PeerHandle::channel(UserId::from("b"), 8);
        registry.register(&room.id, &UserId::from("a"), a);
        registry.register(&room.id, &UserId::from("b"), b);
        let router = SignalingRouter::new(registry, Arc::clone(&store));

        let raw = r#"{"type":"voice_status","is_speaking":true,"is_muted":false}"#;
        router.route(envelope(&room.id, "a", raw)).await;

        assert_eq!(b_rx.try_recv().unwrap(), raw);
        let loaded = store.get_room(&room.id).await.unwrap().unwrap();
        assert_eq!(loaded.active_speakers, vec![UserId::from("a")]);

        let raw = r#"{"type":"voice_status","is_speaking":false}"#;
        router.route(envelope(&room.id, "a", raw)).await;
        let loaded = store.get_room(&room.id).await.unwrap().unwrap();
        assert!(loaded.active_speakers.is_empty());
    }

    #[tokio::test]
    async fn voice_status_broadcasts_when_store_fails() {
        let mut f = fixture(Arc::new(FailingStore), &["a", "b"]);
        let raw = r#"{"type":"voice_status_update","is_speaking":true,"is_muted":true}"#;

        let delivery = f.router.route(envelope(&f.room, "a", raw)).await;
        assert_eq!(delivery.delivered, 1);
        assert_eq!(f.rx[1].1.try_recv().unwrap(), raw);
    }

    #[tokio::test]
    async fn publish_serializes_event() {
        let mut f = fixture(sqlite(), &["a", "b"]);
        let event = RoomEvent::UserDisconnected {
            user_id: UserId::from("c"),
        };
        let delivery = f.router.publish(&f.room, &event, None);
        assert_eq!(delivery.delivered, 2);

        let frame: serde_json::Value =
            serde_json::from_str(&f.rx[0].1.try_recv().unwrap()).unwrap();
        assert_eq!(frame["type"], "user_disconnected");
        assert_eq!(frame["user_id"], "c");
    }

    #[tokio::test]
    async fn per_sender_order_is_preserved() {
        let mut f = fixture(sqlite(), &["a", "b"]);
        for i in 0..5 {
            let raw = format!(r#"{{"type":"chat","n":{i}}}"#);
            f.router.route(envelope(&f.room, "a", &raw)).await;
        }
        for i in 0..5 {
            let frame = f.rx[1].1.try_recv().unwrap();
            assert!(frame.contains(&format!("\"n\":{i}")));
        }
    }
}
