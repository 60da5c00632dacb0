//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! This module binds the websocket endpoint and the read-only discovery API
//! under a single Axum router. Registration, avatar edits, and room creation
//! live in the separate account service; the only write surface here is the
//! dev-gated token bootstrap.

pub mod auth;
pub mod rooms;
pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};

use crate::state::AppState;

/// Build the public router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/ws", get(ws::handle_ws))
        .route("/api/rooms", get(rooms::list_rooms))
        .route("/api/rooms/active", get(rooms::active_rooms))
        .route("/api/rooms/most-watched", get(rooms::most_watched_rooms))
        .route("/api/rooms/search", get(rooms::search_rooms))
        .route("/api/dev/token", post(auth::dev_token))
        .route("/healthz", get(healthz))
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
