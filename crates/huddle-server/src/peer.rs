//! Connection handles.
//!
//! A [`PeerHandle`] is the sending half of one WebSocket connection. Frames are
//! queued into a bounded channel drained by a single writer task, so writes to
//! the socket never interleave no matter how many sessions fan out to it.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use huddle_core::ids::{ConnectionId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("send queue full")]
    QueueFull,
    #[error("connection closed")]
    Closed,
}

#[derive(Clone, Debug)]
pub struct PeerHandle {
    connection_id: ConnectionId,
    user_id: UserId,
    tx: mpsc::Sender<String>,
    shutdown: CancellationToken,
}

impl PeerHandle {
    /// Create a handle plus the receiver its writer task drains.
    pub fn channel(user_id: UserId, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            connection_id: ConnectionId::new(),
            user_id,
            tx,
            shutdown: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Queue a frame without waiting. A full queue drops this frame.
    pub fn send(&self, frame: String) -> Result<(), SendError> {
        if self.shutdown.is_cancelled() {
            return Err(SendError::Closed);
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    user_id = %self.user_id,
                    msg_len = msg.len(),
                    "Send queue full, dropping frame"
                );
                Err(SendError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Ask the owning session to shut down.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once [`close`](Self::close) has been called on any clone.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    pub fn same_connection(&self, other: &PeerHandle) -> bool {
        self.connection_id == other.connection_id
    }
}
