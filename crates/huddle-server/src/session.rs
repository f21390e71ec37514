//! Per-connection session lifecycle.
//!
//! A session moves `Connecting -> Active -> Closed`. While active it feeds
//! every inbound text frame to the signaling router; the reason it closes
//! decides what the rest of the room hears about it.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use huddle_core::ids::RoomId;
use huddle_core::signaling::{ClientFrame, Envelope};

use crate::auth::Identity;
use crate::peer::PeerHandle;
use crate::registry::RoomRegistry;
use crate::rooms::RoomService;
use crate::settings::ServerSettings;

/// How long the writer gets to flush a close frame after the session ends.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Transport went away.
    Disconnected,
    /// The user asked to leave the room.
    Left,
    /// Replaced by a newer connection, or removed by an HTTP leave.
    Evicted,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub send_queue_capacity: usize,
    pub heartbeat_interval: Duration,
}

impl From<&ServerSettings> for SessionConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            send_queue_capacity: settings.send_queue_capacity,
            heartbeat_interval: settings.heartbeat_interval(),
        }
    }
}

pub struct Session {
    room_id: RoomId,
    identity: Identity,
    handle: PeerHandle,
    state: SessionState,
}

impl Session {
    pub fn new(room_id: RoomId, identity: Identity, handle: PeerHandle) -> Self {
        Self {
            room_id,
            identity,
            handle,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle(&self) -> &PeerHandle {
        &self.handle
    }

    /// Register this connection, closing any connection it replaces.
    pub fn activate(&mut self, registry: &RoomRegistry) {
        if self.state != SessionState::Connecting {
            return;
        }
        let user = &self.identity.user_id;
        if let Some(displaced) = registry.register(&self.room_id, user, self.handle.clone()) {
            if !displaced.same_connection(&self.handle) {
                tracing::info!(
                    room_id = %self.room_id,
                    user_id = %user,
                    replaced = %displaced.connection_id(),
                    "Connection superseded"
                );
                displaced.close();
            }
        }
        self.state = SessionState::Active;
        tracing::info!(
            room_id = %self.room_id,
            user_id = %user,
            connection_id = %self.handle.connection_id(),
            "Session active"
        );
    }

    /// Process one inbound text frame.
    pub async fn handle_frame(&mut self, raw: &str, rooms: &RoomService) -> ControlFlow<CloseReason> {
        if self.state != SessionState::Active {
            return ControlFlow::Continue(());
        }

        match ClientFrame::parse(raw) {
            Ok(ClientFrame::LeaveRoom) => ControlFlow::Break(CloseReason::Left),
            Ok(ClientFrame::Signal(message)) => {
                let kind = message.kind().to_owned();
                let delivery = rooms
                    .router()
                    .route(Envelope {
                        room_id: self.room_id.clone(),
                        from_user: self.identity.user_id.clone(),
                        message,
                        payload: raw.to_owned(),
                    })
                    .await;
                tracing::trace!(
                    room_id = %self.room_id,
                    user_id = %self.identity.user_id,
                    kind = %kind,
                    delivered = delivery.delivered,
                    failed = delivery.failed,
                    "Relayed frame"
                );
                ControlFlow::Continue(())
            }
            Err(err) => {
                tracing::debug!(
                    room_id = %self.room_id,
                    user_id = %self.identity.user_id,
                    error = %err,
                    "Ignoring malformed frame"
                );
                ControlFlow::Continue(())
            }
        }
    }

    /// Close the session. Only the first call has any effect.
    pub async fn close(&mut self, reason: CloseReason, rooms: &RoomService) {
        if self.state == SessionState::Closed {
            return;
        }
        let was_active = self.state == SessionState::Active;
        self.state = SessionState::Closed;
        let user = &self.identity.user_id;

        match reason {
            CloseReason::Disconnected if was_active => {
                rooms.disconnected(&self.room_id, user, self.handle.connection_id());
            }
            CloseReason::Left if was_active => {
                if let Err(err) = rooms.leave(&self.room_id, user).await {
                    tracing::warn!(room_id = %self.room_id, user_id = %user, error = %err, "Leave failed");
                    rooms.disconnected(&self.room_id, user, self.handle.connection_id());
                }
            }
            _ => {}
        }
        self.handle.close();

        tracing::info!(
            room_id = %self.room_id,
            user_id = %user,
            connection_id = %self.handle.connection_id(),
            ?reason,
            "Session closed"
        );
    }
}

/// Drive one accepted WebSocket until it closes.
pub async fn run_session(
    socket: WebSocket,
    room_id: RoomId,
    identity: Identity,
    rooms: Arc<RoomService>,
    config: SessionConfig,
) {
    let (handle, rx) = PeerHandle::channel(identity.user_id.clone(), config.send_queue_capacity);
    let (ws_tx, mut ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_loop(ws_tx, rx, handle.clone(), config.heartbeat_interval));
    let mut writer_done = false;

    let mut session = Session::new(room_id, identity, handle.clone());
    session.activate(rooms.registry());

    let reason = loop {
        tokio::select! {
            _ = handle.closed() => break CloseReason::Evicted,
            _ = &mut writer => {
                writer_done = true;
                break CloseReason::Disconnected;
            }
            frame = ws_rx.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    if let ControlFlow::Break(reason) = session.handle_frame(text.as_str(), &rooms).await {
                        break reason;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break CloseReason::Disconnected,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "WebSocket read failed");
                    break CloseReason::Disconnected;
                }
            }
        }
    };

    session.close(reason, &rooms).await;

    if !writer_done && tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
}

/// Single writer per connection: drains the send queue and pings.
async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<String>,
    handle: PeerHandle,
    heartbeat: Duration,
) {
    let mut ping_interval = tokio::time::interval(heartbeat);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(text) => {
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = ping_interval.tick() => {
                if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                tracing::trace!(connection_id = %handle.connection_id(), "Sent ping");
            }
            _ = handle.closed() => {
                // Flush what was queued before the close, then say goodbye.
                while let Ok(text) = rx.try_recv() {
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }
}
