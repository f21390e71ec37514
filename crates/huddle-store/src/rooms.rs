use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use huddle_core::ids::{RoomId, UserId};

use crate::database::Database;
use crate::error::StoreError;

/// A durable room record with its participant and speaker lists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub id: RoomId,
    pub name: Option<String>,
    pub language: String,
    pub level: String,
    pub max_users: u32,
    pub is_private: bool,
    pub created_by: UserId,
    pub created_at: String,
    /// Participants in join order.
    pub participants: Vec<UserId>,
    pub active_speakers: Vec<UserId>,
}

impl RoomRecord {
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.max_users as usize
    }

    pub fn has_participant(&self, user_id: &UserId) -> bool {
        self.participants.contains(user_id)
    }
}

/// Fields supplied when creating a room.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewRoom {
    pub name: Option<String>,
    pub language: String,
    pub level: String,
    pub max_users: u32,
    pub is_private: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
    Full,
    NotFound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaveOutcome {
    Left { was_member: bool, remaining: usize },
    NotFound,
}

pub struct RoomRepo {
    db: Database,
}

impl RoomRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a room; the creator becomes its first participant.
    #[instrument(skip(self, room), fields(creator = %creator))]
    pub fn create(&self, room: &NewRoom, creator: &UserId) -> Result<RoomRecord, StoreError> {
        self.db.with_conn(|conn| {
            let id = RoomId::new();
            let now = Utc::now().to_rfc3339();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO rooms (id, name, language, level, max_users, is_private, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id.as_str(),
                    room.name,
                    room.language,
                    room.level,
                    room.max_users,
                    room.is_private,
                    creator.as_str(),
                    now
                ],
            )?;
            tx.execute(
                "INSERT INTO room_participants (room_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                params![id.as_str(), creator.as_str(), now],
            )?;
            tx.commit()?;

            Ok(RoomRecord {
                id,
                name: room.name.clone(),
                language: room.language.clone(),
                level: room.level.clone(),
                max_users: room.max_users,
                is_private: room.is_private,
                created_by: creator.clone(),
                created_at: now,
                participants: vec![creator.clone()],
                active_speakers: Vec::new(),
            })
        })
    }

    #[instrument(skip(self), fields(room_id = %id))]
    pub fn get(&self, id: &RoomId) -> Result<Option<RoomRecord>, StoreError> {
        self.db.with_conn(|conn| load_room(conn, id))
    }

    /// List all rooms, oldest first.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<RoomRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let ids: Vec<String> = conn
                .prepare("SELECT id FROM rooms ORDER BY created_at ASC, id ASC")?
                .query_map([], |row| row.get(0))?
                .collect::<Result<_, _>>()?;

            let mut rooms = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(room) = load_room(conn, &RoomId::from(id))? {
                    rooms.push(room);
                }
            }
            Ok(rooms)
        })
    }

    /// Add a participant, enforcing capacity. Existing members are accepted
    /// without a capacity check.
    #[instrument(skip(self), fields(room_id = %room_id, user_id = %user_id))]
    pub fn join(&self, room_id: &RoomId, user_id: &UserId) -> Result<JoinOutcome, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let max_users: Option<u32> = tx
                .query_row(
                    "SELECT max_users FROM rooms WHERE id = ?1",
                    [room_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(max_users) = max_users else {
                return Ok(JoinOutcome::NotFound);
            };

            if is_participant(&tx, room_id, user_id)? {
                return Ok(JoinOutcome::AlreadyMember);
            }

            if participant_count(&tx, room_id)? >= max_users as usize {
                return Ok(JoinOutcome::Full);
            }

            tx.execute(
                "INSERT INTO room_participants (room_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                params![room_id.as_str(), user_id.as_str(), Utc::now().to_rfc3339()],
            )?;
            tx.commit()?;
            Ok(JoinOutcome::Joined)
        })
    }

    /// Remove a participant and their speaker flag.
    #[instrument(skip(self), fields(room_id = %room_id, user_id = %user_id))]
    pub fn leave(&self, room_id: &RoomId, user_id: &UserId) -> Result<LeaveOutcome, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            if !room_exists(&tx, room_id)? {
                return Ok(LeaveOutcome::NotFound);
            }

            let removed = tx.execute(
                "DELETE FROM room_participants WHERE room_id = ?1 AND user_id = ?2",
                [room_id.as_str(), user_id.as_str()],
            )?;
            tx.execute(
                "DELETE FROM room_speakers WHERE room_id = ?1 AND user_id = ?2",
                [room_id.as_str(), user_id.as_str()],
            )?;
            let remaining = participant_count(&tx, room_id)?;
            tx.commit()?;

            Ok(LeaveOutcome::Left {
                was_member: removed > 0,
                remaining,
            })
        })
    }

    /// Delete a room and everything attached to it. Returns whether it existed.
    #[instrument(skip(self), fields(room_id = %room_id))]
    pub fn delete(&self, room_id: &RoomId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM rooms WHERE id = ?1", [room_id.as_str()])?;
            Ok(deleted > 0)
        })
    }

    /// Add or remove a user from the room's active-speaker set.
    /// A missing room is a no-op.
    #[instrument(skip(self), fields(room_id = %room_id, user_id = %user_id))]
    pub fn set_active_speaker(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        speaking: bool,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            if speaking {
                if room_exists(conn, room_id)? {
                    conn.execute(
                        "INSERT OR IGNORE INTO room_speakers (room_id, user_id) VALUES (?1, ?2)",
                        [room_id.as_str(), user_id.as_str()],
                    )?;
                }
            } else {
                conn.execute(
                    "DELETE FROM room_speakers WHERE room_id = ?1 AND user_id = ?2",
                    [room_id.as_str(), user_id.as_str()],
                )?;
            }
            Ok(())
        })
    }

    pub fn ping(&self) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute_batch("SELECT 1")?;
            Ok(())
        })
    }
}

fn room_exists(conn: &Connection, room_id: &RoomId) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM rooms WHERE id = ?1", [room_id.as_str()], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

fn is_participant(conn: &Connection, room_id: &RoomId, user_id: &UserId) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM room_participants WHERE room_id = ?1 AND user_id = ?2",
            [room_id.as_str(), user_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn participant_count(conn: &Connection, room_id: &RoomId) -> Result<usize, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM room_participants WHERE room_id = ?1",
        [room_id.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

fn user_column(conn: &Connection, sql: &str, room_id: &RoomId) -> Result<Vec<UserId>, StoreError> {
    let ids = conn
        .prepare(sql)?
        .query_map([room_id.as_str()], |row| row.get::<_, String>(0))?
        .map(|r| r.map(UserId::from))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn load_room(conn: &Connection, id: &RoomId) -> Result<Option<RoomRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, name, language, level, max_users, is_private, created_by, created_at
             FROM rooms WHERE id = ?1",
            [id.as_str()],
            |row| {
                Ok(RoomRecord {
                    id: RoomId::from(row.get::<_, String>(0)?),
                    name: row.get(1)?,
                    language: row.get(2)?,
                    level: row.get(3)?,
                    max_users: row.get(4)?,
                    is_private: row.get(5)?,
                    created_by: UserId::from(row.get::<_, String>(6)?),
                    created_at: row.get(7)?,
                    participants: Vec::new(),
                    active_speakers: Vec::new(),
                })
            },
        )
        .optional()?;

    let Some(mut room) = row else {
        return Ok(None);
    };
    room.participants = user_column(
        conn,
        "SELECT user_id FROM room_participants WHERE room_id = ?1 ORDER BY seq",
        id,
    )?;
    room.active_speakers = user_column(
        conn,
        "SELECT user_id FROM room_speakers WHERE room_id = ?1 ORDER BY seq",
        id,
    )?;
    Ok(Some(room))
}
