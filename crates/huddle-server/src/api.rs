//! HTTP and WebSocket handlers.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use huddle_core::ids::{RoomId, UserId};
use huddle_store::{NewRoom, RoomRecord};

use crate::auth::{AuthError, Identity};
use crate::rooms::{RelayKind, RoomError};
use crate::server::AppState;
use crate::session::{self, SessionConfig};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(#[from] AuthError),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<RoomError> for ApiError {
    fn from(err: RoomError) -> Self {
        match err {
            RoomError::NotFound(_) => Self::NotFound(err.to_string()),
            RoomError::Full(_) => Self::BadRequest(err.to_string()),
            RoomError::Store(e) => {
                tracing::error!(error = %e, "Store failure");
                Self::Internal("storage unavailable".into())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({"error": self.code(), "message": self.to_string()}));
        if status == StatusCode::UNAUTHORIZED {
            (status, [(WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

impl FromRequestParts<AppState> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::Missing)?;
        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .ok_or(AuthError::Missing)?;
        Ok(state.verifier.verify(token.trim())?)
    }
}

/// Room as returned by the HTTP API.
#[derive(Debug, Serialize)]
pub struct RoomView {
    pub id: RoomId,
    pub name: Option<String>,
    pub language: String,
    pub level: String,
    pub max_users: u32,
    pub is_private: bool,
    pub created_by: UserId,
    pub created_at: String,
    pub participants: Vec<UserId>,
    pub participant_count: usize,
    pub is_full: bool,
    pub active_speakers: Vec<UserId>,
}

impl From<RoomRecord> for RoomView {
    fn from(room: RoomRecord) -> Self {
        Self {
            participant_count: room.participant_count(),
            is_full: room.is_full(),
            id: room.id,
            name: room.name,
            language: room.language,
            level: room.level,
            max_users: room.max_users,
            is_private: room.is_private,
            created_by: room.created_by,
            created_at: room.created_at,
            participants: room.participants,
            active_speakers: room.active_speakers,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub language: String,
    pub level: String,
    #[serde(default)]
    pub max_users: Option<u32>,
    #[serde(default)]
    pub is_private: bool,
}

/// Body of the three WebRTC relay endpoints. The payload field is named
/// after the message kind (`offer`, `answer`, or `candidate`).
#[derive(Debug, Deserialize)]
pub struct RelayRequest {
    pub room_id: RoomId,
    pub to_user: UserId,
    #[serde(alias = "offer", alias = "answer", alias = "candidate")]
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct VoiceStatusRequest {
    pub room_id: RoomId,
    #[serde(default)]
    pub user_id: Option<UserId>,
    pub is_speaking: bool,
    #[serde(default)]
    pub is_muted: bool,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: Option<String>,
}

fn message(text: &str) -> Json<Value> {
    Json(json!({ "message": text }))
}

pub async fn root() -> Json<Value> {
    message("Huddle signaling relay is running")
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = match state.rooms.store().ping().await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(error = %err, "Health check: store ping failed");
            false
        }
    };
    let registry = state.rooms.registry();
    let body = json!({
        "status": if store_ok { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "components": {
            "store": if store_ok { "ok" } else { "error" },
            "rooms": registry.room_count(),
            "connections": registry.connection_count(),
        },
    });
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

pub async fn me(identity: Identity) -> Json<Value> {
    Json(json!(identity.summary()))
}

pub async fn list_rooms(State(state): State<AppState>) -> Result<Json<Vec<RoomView>>, ApiError> {
    let rooms = state.rooms.list_rooms().await?;
    Ok(Json(rooms.into_iter().map(RoomView::from).collect()))
}

pub async fn create_room(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<CreateRoomRequest>,
) -> Result<Json<RoomView>, ApiError> {
    if req.language.trim().is_empty() {
        return Err(ApiError::BadRequest("language is required".into()));
    }
    let room = NewRoom {
        name: req.name,
        language: req.language,
        level: req.level,
        max_users: req.max_users.unwrap_or(state.rooms.default_max_users()),
        is_private: req.is_private,
    };
    let record = state.rooms.create_room(room, &identity).await?;
    Ok(Json(record.into()))
}

pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
) -> Result<Json<RoomView>, ApiError> {
    Ok(Json(state.rooms.get_room(&room_id).await?.into()))
}

pub async fn join_room(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    identity: Identity,
) -> Result<Json<Value>, ApiError> {
    state.rooms.join(&room_id, &identity).await?;
    Ok(message("Successfully joined room"))
}

pub async fn leave_room(
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    identity: Identity,
) -> Result<Json<Value>, ApiError> {
    state.rooms.leave(&room_id, &identity.user_id).await?;
    Ok(message("Successfully left room"))
}

fn relay(state: &AppState, kind: RelayKind, identity: &Identity, req: RelayRequest) {
    state
        .rooms
        .relay(kind, &req.room_id, identity, &req.to_user, req.payload);
}

pub async fn send_offer(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<RelayRequest>,
) -> Json<Value> {
    relay(&state, RelayKind::Offer, &identity, req);
    message("Offer sent")
}

pub async fn send_answer(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<RelayRequest>,
) -> Json<Value> {
    relay(&state, RelayKind::Answer, &identity, req);
    message("Answer sent")
}

pub async fn send_ice_candidate(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<RelayRequest>,
) -> Json<Value> {
    relay(&state, RelayKind::IceCandidate, &identity, req);
    message("ICE candidate sent")
}

pub async fn voice_status(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<VoiceStatusRequest>,
) -> Json<Value> {
    let subject = req.user_id.unwrap_or_else(|| identity.user_id.clone());
    state
        .rooms
        .voice_status(
            &req.room_id,
            &identity.user_id,
            &subject,
            req.is_speaking,
            req.is_muted,
        )
        .await;
    message("Voice status updated")
}

/// `GET /ws/{room_id}/{user_id}?token=...`
///
/// Only a participant of an existing room, holding a token for that user,
/// gets a session.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((room_id, user_id)): Path<(RoomId, UserId)>,
    Query(query): Query<WsQuery>,
) -> Result<Response, ApiError> {
    let token = query.token.unwrap_or_default();
    let identity = state.verifier.verify_for(&token, &user_id)?;

    let room = state.rooms.get_room(&room_id).await?;
    if !room.has_participant(&user_id) {
        return Err(ApiError::Forbidden(format!("{user_id} is not a participant of {room_id}")));
    }

    let rooms = state.rooms.clone();
    let config = SessionConfig::from(&state.settings.server);
    tracing::debug!(room_id = %room_id, user_id = %user_id, "Upgrading WebSocket");
    Ok(ws.on_upgrade(move |socket| session::run_session(socket, room_id, identity, rooms, config)))
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    async fn body_json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn errors_render_json_bodies() {
        let resp = ApiError::from(RoomError::Full(RoomId::from("r"))).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "bad_request");
        assert_eq!(body["message"], "Room is full");

        let resp = ApiError::from(RoomError::NotFound(RoomId::from("r"))).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["message"], "Room not found");
    }

    #[test]
    fn unauthorized_carries_challenge() {
        let resp = ApiError::Unauthorized(AuthError::Expired).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()[WWW_AUTHENTICATE], "Bearer");
    }

    #[test]
    fn store_errors_are_opaque_500s() {
        let err = ApiError::from(RoomError::Store(huddle_store::StoreError::Database(
            "disk I/O error at /var/lib/secret".into(),
        )));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.to_string().contains("/var/lib"));
    }

    #[test]
    fn relay_request_accepts_kind_named_payload() {
        for field in ["offer", "answer", "candidate"] {
            let mut body = json!({"room_id": "r", "to_user": "b", "from_user": "x"});
            body[field] = json!({"k": 1});
            let req: RelayRequest = serde_json::from_value(body).unwrap();
            assert_eq!(req.to_user, UserId::from("b"));
            assert_eq!(req.payload["k"], 1);
        }
    }

    #[test]
    fn room_view_derives_counts() {
        let view = RoomView::from(RoomRecord {
            id: RoomId::from("r"),
            name: None,
            language: "en".into(),
            level: "any".into(),
            max_users: 2,
            is_private: false,
            created_by: UserId::from("a"),
            created_at: "2024-01-01T00:00:00Z".into(),
            participants: vec![UserId::from("a"), UserId::from("b")],
            active_speakers: vec![],
        });
        assert_eq!(view.participant_count, 2);
        assert!(view.is_full);

        let json = serde_json::to_value(&view).unwrap();
        for key in [
            "id",
            "name",
            "language",
            "level",
            "max_users",
            "is_private",
            "created_by",
            "created_at",
            "participants",
            "participant_count",
            "is_full",
            "active_speakers",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }
}
