//! In-memory room presence.
//!
//! Maps each room to the connections currently attached to it. Entries live in
//! a `DashMap`, so mutations lock only the shard holding that room and
//! operations on unrelated rooms proceed in parallel. No method awaits or
//! performs I/O; callers clone handles out and send after the lock is gone.

use std::collections::HashMap;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use huddle_core::ids::{ConnectionId, RoomId, UserId};

use crate::peer::PeerHandle;

#[derive(Default)]
struct RoomEntry {
    /// Connected users in the order they first connected.
    members: Vec<UserId>,
    peers: HashMap<UserId, PeerHandle>,
}

/// Registry of live connections, keyed by room then user.
///
/// A room is present iff at least one user is connected to it.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<RoomId, RoomEntry>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `handle` as the connection for `(room, user)`.
    ///
    /// Returns the handle it replaced, if the user was already connected.
    pub fn register(&self, room: &RoomId, user: &UserId, handle: PeerHandle) -> Option<PeerHandle> {
        let mut entry = self.rooms.entry(room.clone()).or_default();
        if !entry.members.contains(user) {
            entry.members.push(user.clone());
        }
        entry.peers.insert(user.clone(), handle)
    }

    /// Detach whatever connection `(room, user)` has. No-op if absent.
    pub fn unregister(&self, room: &RoomId, user: &UserId) -> Option<PeerHandle> {
        self.remove_where(room, user, |_| true)
    }

    /// Detach `(room, user)` only while `connection` is still the registered
    /// one. Returns false if it was already replaced or removed.
    pub fn unregister_connection(&self, room: &RoomId, user: &UserId, connection: &ConnectionId) -> bool {
        self.remove_where(room, user, |peer| peer.connection_id() == connection)
            .is_some()
    }

    fn remove_where(
        &self,
        room: &RoomId,
        user: &UserId,
        matches: impl FnOnce(&PeerHandle) -> bool,
    ) -> Option<PeerHandle> {
        let Entry::Occupied(mut occupied) = self.rooms.entry(room.clone()) else {
            return None;
        };

        let entry = occupied.get_mut();
        if !entry.peers.get(user).is_some_and(matches) {
            return None;
        }
        let removed = entry.peers.remove(user);
        entry.members.retain(|m| m != user);

        if entry.peers.is_empty() {
            occupied.remove();
        }
        removed
    }

    pub fn lookup(&self, room: &RoomId, user: &UserId) -> Option<PeerHandle> {
        self.rooms.get(room)?.peers.get(user).cloned()
    }

    /// Snapshot of connected users, in connection order.
    pub fn members_of(&self, room: &RoomId) -> Vec<UserId> {
        self.rooms
            .get(room)
            .map(|entry| entry.members.clone())
            .unwrap_or_default()
    }

    /// Snapshot of handles in member order, minus `exclude`.
    pub fn recipients(&self, room: &RoomId, exclude: Option<&UserId>) -> Vec<PeerHandle> {
        let Some(entry) = self.rooms.get(room) else {
            return Vec::new();
        };
        entry
            .members
            .iter()
            .filter(|user| Some(*user) != exclude)
            .filter_map(|user| entry.peers.get(user).cloned())
            .collect()
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn contains_room(&self, room: &RoomId) -> bool {
        self.rooms.contains_key(room)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.rooms.iter().map(|entry| entry.peers.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn peer(user: &str) -> (PeerHandle, tokio::sync::mpsc::Receiver<String>) {
        PeerHandle::channel(UserId::from(user), 16)
    }

    #[test]
    fn register_creates_room() {
        let registry = RoomRegistry::new();
        let room = RoomId::from("r1");
        let (a, _rx) = peer("a");

        assert!(!registry.contains_room(&room));
        assert!(registry.register(&room, &UserId::from("a"), a).is_none());
        assert!(registry.contains_room(&room));
        assert_eq!(registry.members_of(&room), vec![UserId::from("a")]);
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn re_register_replaces_handle() {
        let registry = RoomRegistry::new();
        let room = RoomId::from("r1");
        let user = UserId::from("a");
        let (old, _rx1) = peer("a");
        let (new, _rx2) = peer("a");

        registry.register(&room, &user, old.clone());
        let displaced = registry.register(&room, &user, new.clone()).unwrap();
        assert!(displaced.same_connection(&old));

        let current = registry.lookup(&room, &user).unwrap();
        assert!(current.same_connection(&new));
        assert_eq!(registry.members_of(&room), vec![user]);
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn members_keep_connection_order() {
        let registry = RoomRegistry::new();
        let room = RoomId::from("r1");
        let mut keep = Vec::new();
        for name in ["c", "a", "b"] {
            let (handle, rx) = peer(name);
            keep.push(rx);
            registry.register(&room, &UserId::from(name), handle);
        }
        let names: Vec<String> = registry
            .members_of(&room)
            .iter()
            .map(|u| u.to_string())
            .collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn last_unregister_removes_room() {
        let registry = RoomRegistry::new();
        let room = RoomId::from("r1");
        let (a, _ra) = peer("a");
        let (b, _rb) = peer("b");
        registry.register(&room, &UserId::from("a"), a);
        registry.register(&room, &UserId::from("b"), b);

        assert!(registry.unregister(&room, &UserId::from("b")).is_some());
        assert!(registry.contains_room(&room));
        assert_eq!(registry.members_of(&room), vec![UserId::from("a")]);

        assert!(registry.unregister(&room, &UserId::from("a")).is_some());
        assert!(!registry.contains_room(&room));
        assert_eq!(registry.room_count(), 0);
        assert!(registry.members_of(&room).is_empty());
    }

    #[test]
    fn unregister_absent_is_noop() {
        let registry = RoomRegistry::new();
        let room = RoomId::from("r1");
        assert!(registry.unregister(&room, &UserId::from("ghost")).is_none());

        let (a, _ra) = peer("a");
        registry.register(&room, &UserId::from("a"), a);
        assert!(registry.unregister(&room, &UserId::from("ghost")).is_none());
        assert_eq!(registry.members_of(&room), vec![UserId::from("a")]);
    }

    #[test]
    fn stale_connection_cannot_evict_replacement() {
        let registry = RoomRegistry::new();
        let room = RoomId::from("r1");
        let user = UserId::from("a");
        let (old, _rx1) = peer("a");
        let (new, _rx2) = peer("a");
        registry.register(&room, &user, old.clone());
        registry.register(&room, &user, new.clone());

        assert!(!registry.unregister_connection(&room, &user, old.connection_id()));
        assert!(registry.lookup(&room, &user).is_some());

        assert!(registry.unregister_connection(&room, &user, new.connection_id()));
        assert!(!registry.contains_room(&room));
    }

    #[test]
    fn recipients_exclude_sender() {
        let registry = RoomRegistry::new();
        let room = RoomId::from("r1");
        let mut keep = Vec::new();
        for name in ["a", "b", "c"] {
            let (handle, rx) = peer(name);
            keep.push(rx);
            registry.register(&room, &UserId::from(name), handle);
        }

        let all = registry.recipients(&room, None);
        assert_eq!(all.len(), 3);

        let others = registry.recipients(&room, Some(&UserId::from("b")));
        let users: Vec<&str> = others.iter().map(|p| p.user_id().as_str()).collect();
        assert_eq!(users, vec!["a", "c"]);

        let absent = registry.recipients(&room, Some(&UserId::from("zed")));
        assert_eq!(absent.len(), 3);
        assert!(registry.recipients(&RoomId::from("other"), None).is_empty());
    }

    #[test]
    fn rooms_are_independent() {
        let registry = RoomRegistry::new();
        let (a, _ra) = peer("a");
        let (a2, _ra2) = peer("a");
        registry.register(&RoomId::from("r1"), &UserId::from("a"), a);
        registry.register(&RoomId::from("r2"), &UserId::from("a"), a2);
        assert_eq!(registry.room_count(), 2);

        registry.unregister(&RoomId::from("r1"), &UserId::from("a"));
        assert!(registry.lookup(&RoomId::from("r2"), &UserId::from("a")).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_churn_leaves_no_empty_rooms() {
        let registry = Arc::new(RoomRegistry::new());
        let mut tasks = Vec::new();
        for worker in 0..8 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                for i in 0..200 {
                    let room = RoomId::from(format!("room-{}", i % 4));
                    let user = UserId::from(format!("user-{worker}"));
                    let (handle, _rx) = PeerHandle::channel(user.clone(), 1);
                    registry.register(&room, &user, handle);
                    tokio::task::yield_now().await;
                    registry.unregister(&room, &user);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.connection_count(), 0);
    }
}
