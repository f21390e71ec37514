use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use huddle_store::RoomStore;

use crate::api;
use crate::auth::TokenVerifier;
use crate::rooms::RoomService;
use crate::settings::HuddleSettings;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<RoomService>,
    pub verifier: Arc<TokenVerifier>,
    pub settings: Arc<HuddleSettings>,
}

impl AppState {
    pub fn new(settings: HuddleSettings, store: Arc<dyn RoomStore>) -> Self {
        let verifier = TokenVerifier::new(&settings.auth.token_secret);
        let rooms = RoomService::new(store, settings.rooms.clone());
        Self {
            rooms: Arc::new(rooms),
            verifier: Arc::new(verifier),
            settings: Arc::new(settings),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/", get(api::root))
        .route("/health", get(api::health))
        .route("/auth/me", get(api::me))
        .route("/rooms", get(api::list_rooms).post(api::create_room))
        .route("/rooms/{room_id}", get(api::get_room))
        .route("/rooms/{room_id}/join", post(api::join_room))
        .route("/rooms/{room_id}/leave", post(api::leave_room))
        .route("/webrtc/offer", post(api::send_offer))
        .route("/webrtc/answer", post(api::send_answer))
        .route("/webrtc/ice-candidate", post(api::send_ice_candidate))
        .route("/voice/status", post(api::voice_status));

    Router::new()
        .nest("/api", routes)
        .route("/api/", get(api::root))
        .route("/ws/{room_id}/{user_id}", get(api::ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. Returns a handle to shut it down.
pub async fn start(
    settings: HuddleSettings,
    store: Arc<dyn RoomStore>,
) -> Result<ServerHandle, std::io::Error> {
    let addr = settings.bind_addr();
    let state = AppState::new(settings, store);
    let router = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "Huddle server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
        if let Err(err) = result {
            tracing::error!(error = %err, "Server error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        state,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`; keeps the server task alive.
pub struct ServerHandle {
    pub port: u16,
    state: AppState,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop accepting connections and wait for in-flight requests.
    ///
    /// Open WebSocket sessions are closed without notifying their rooms.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for room in self.state.rooms.registry().room_ids() {
            for peer in self.state.rooms.registry().recipients(&room, None) {
                peer.close();
            }
        }
        if let Err(err) = self.server.await {
            tracing::warn!(error = %err, "Server task ended abnormally");
        }
        tracing::info!("Huddle server stopped");
    }
}
