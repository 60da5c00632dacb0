//! Discovery routes — read-only queries over the room registry.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use tracing::error;

use crate::registry::RoomSummary;
use crate::state::AppState;

/// `GET /api/rooms` — every public room, newest first.
pub async fn list_rooms(State(state): State<AppState>) -> Result<Json<Vec<RoomSummary>>, StatusCode> {
    match state.registry.public_rooms().await {
        Ok(rooms) => Ok(Json(rooms)),
        Err(e) => {
            error!(error = %e, "public-rooms listing failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// `GET /api/rooms/active` — the canonical room plus every occupied room.
pub async fn active_rooms(State(state): State<AppState>) -> Result<Json<Vec<RoomSummary>>, StatusCode> {
    match state.registry.active_rooms().await {
        Ok(rooms) => Ok(Json(rooms)),
        Err(e) => {
            error!(error = %e, "active-rooms query failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// `GET /api/rooms/most-watched` — spectated rooms, most watched first.
pub async fn most_watched_rooms(State(state): State<AppState>) -> Json<Vec<RoomSummary>> {
    Json(state.registry.most_watched_rooms().await)
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
}

/// `GET /api/rooms/search?q=` — substring search over public rooms and
/// owner display names.
pub async fn search_rooms(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<RoomSummary>>, StatusCode> {
    match state.registry.search(&params.q).await {
        Ok(rooms) => Ok(Json(rooms)),
        Err(e) => {
            error!(error = %e, "room search failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
