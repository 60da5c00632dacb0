//! Dev-only token bootstrap.
//!
//! The real token mint belongs to the account REST service; this route lets
//! bots and local clients handshake without it. Enabled only when
//! `DEV_AUTH_BYPASS=true`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::services::token;
use crate::state::AppState;

fn dev_auth_bypass_enabled() -> bool {
    std::env::var("DEV_AUTH_BYPASS").is_ok_and(|v| v == "true" || v == "1")
}

fn default_color() -> String {
    "#3B82F6".to_owned()
}

#[derive(Debug, Deserialize)]
pub struct DevTokenBody {
    pub name: String,
    #[serde(default = "default_color")]
    pub color: String,
}

/// `POST /api/dev/token` — upsert a dev user and mint a short-lived token.
pub async fn dev_token(
    State(state): State<AppState>,
    Json(body): Json<DevTokenBody>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if !dev_auth_bypass_enabled() {
        return Err(StatusCode::NOT_FOUND);
    }

    let (user_id,) = sqlx::query_as::<_, (Uuid,)>(
        "INSERT INTO users (id, username, body_color) VALUES ($1, $2, $3)
         ON CONFLICT (username) DO UPDATE SET body_color = EXCLUDED.body_color
         RETURNING id",
    )
    .bind(Uuid::new_v4())
    .bind(&body.name)
    .bind(&body.color)
    .fetch_one(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "dev user upsert failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let token = token::mint(&state.config.token_secret, user_id, &body.name, &body.color, state.config.token_ttl);
    Ok(Json(serde_json::json!({ "token": token, "agentId": user_id })))
}
