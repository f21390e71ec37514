//! Async facade over the room repository.
//!
//! The relay reaches the room store only through [`RoomStore`], so request
//! handlers and session loops never run SQLite work on a runtime thread.

use std::sync::Arc;

use async_trait::async_trait;

use huddle_core::ids::{RoomId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::rooms::{JoinOutcome, LeaveOutcome, NewRoom, RoomRecord, RoomRepo};

#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn create_room(&self, room: NewRoom, creator: UserId) -> Result<RoomRecord, StoreError>;
    async fn list_rooms(&self) -> Result<Vec<RoomRecord>, StoreError>;
    async fn get_room(&self, room_id: &RoomId) -> Result<Option<RoomRecord>, StoreError>;
    async fn join(&self, room_id: &RoomId, user_id: &UserId) -> Result<JoinOutcome, StoreError>;
    async fn leave(&self, room_id: &RoomId, user_id: &UserId) -> Result<LeaveOutcome, StoreError>;
    async fn delete_room(&self, room_id: &RoomId) -> Result<bool, StoreError>;
    async fn set_active_speaker(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        speaking: bool,
    ) -> Result<(), StoreError>;
    async fn ping(&self) -> Result<(), StoreError>;
}

/// SQLite-backed [`RoomStore`]; each call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteRoomStore {
    repo: Arc<RoomRepo>,
}

impl SqliteRoomStore {
    pub fn new(db: Database) -> Self {
        Self {
            repo: Arc::new(RoomRepo::new(db)),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&RoomRepo) -> Result<T, StoreError> + Send + 'static,
    {
        let repo = Arc::clone(&self.repo);
        tokio::task::spawn_blocking(move || f(&repo)).await?
    }
}

#[async_trait]
impl RoomStore for SqliteRoomStore {
    async fn create_room(&self, room: NewRoom, creator: UserId) -> Result<RoomRecord, StoreError> {
        self.blocking(move |repo| repo.create(&room, &creator)).await
    }

    async fn list_rooms(&self) -> Result<Vec<RoomRecord>, StoreError> {
        self.blocking(|repo| repo.list()).await
    }

    async fn get_room(&self, room_id: &RoomId) -> Result<Option<RoomRecord>, StoreError> {
        let room_id = room_id.clone();
        self.blocking(move |repo| repo.get(&room_id)).await
    }

    async fn join(&self, room_id: &RoomId, user_id: &UserId) -> Result<JoinOutcome, StoreError> {
        let (room_id, user_id) = (room_id.clone(), user_id.clone());
        self.blocking(move |repo| repo.join(&room_id, &user_id)).await
    }

    async fn leave(&self, room_id: &RoomId, user_id: &UserId) -> Result<LeaveOutcome, StoreError> {
        let (room_id, user_id) = (room_id.clone(), user_id.clone());
        self.blocking(move |repo| repo.leave(&room_id, &user_id)).await
    }

    async fn delete_room(&self, room_id: &RoomId) -> Result<bool, StoreError> {
        let room_id = room_id.clone();
        self.blocking(move |repo| repo.delete(&room_id)).await
    }

    async fn set_active_speaker(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        speaking: bool,
    ) -> Result<(), StoreError> {
        let (room_id, user_id) = (room_id.clone(), user_id.clone());
        self.blocking(move |repo| repo.set_active_speaker(&room_id, &user_id, speaking))
            .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.blocking(|repo| repo.ping()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteRoomStore {
        SqliteRoomStore::new(Database::in_memory().unwrap())
    }

    #[tokio::test]
    async fn round_trip_through_blocking_pool() {
        let store = store();
        let alice = UserId::from("alice");
        let room = store
            .create_room(
                NewRoom {
                    name: None,
                    language: "fr".into(),
                    level: "advanced".into(),
                    max_users: 3,
                    is_private: true,
                },
                alice.clone(),
            )
            .await
            .unwrap();

        assert_eq!(store.join(&room.id, &UserId::from("bob")).await.unwrap(), JoinOutcome::Joined);
        store
            .set_active_speaker(&room.id, &alice, true)
            .await
            .unwrap();

        let loaded = store.get_room(&room.id).await.unwrap().unwrap();
        assert_eq!(loaded.participant_count(), 2);
        assert_eq!(loaded.active_speakers, vec![alice]);
        assert!(loaded.is_private);
        assert_eq!(store.list_rooms().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn leave_then_delete() {
        let store = store();
        let alice = UserId::from("alice");
        let room = store
            .create_room(
                NewRoom {
                    name: Some("r".into()),
                    language: "en".into(),
                    level: "any".into(),
                    max_users: 8,
                    is_private: false,
                },
                alice.clone(),
            )
            .await
            .unwrap();

        let outcome = store.leave(&room.id, &alice).await.unwrap();
        assert_eq!(
            outcome,
            LeaveOutcome::Left {
                was_member: true,
                remaining: 0
            }
        );
        assert!(store.delete_room(&room.id).await.unwrap());
        assert!(store.get_room(&room.id).await.unwrap().is_none());
        assert_eq!(store.leave(&room.id, &alice).await.unwrap(), LeaveOutcome::NotFound);
    }

    #[tokio::test]
    async fn ping_succeeds() {
        store().ping().await.unwrap();
    }
}
