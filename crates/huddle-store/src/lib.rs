//! Durable room and participant records.

pub mod database;
pub mod error;
pub mod rooms;
pub mod schema;
pub mod store;

pub use database::Database;
pub use error::StoreError;
pub use rooms::{JoinOutcome, LeaveOutcome, NewRoom, RoomRecord, RoomRepo};
pub use store::{RoomStore, SqliteRoomStore};
