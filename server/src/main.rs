mod config;
mod db;
mod engine;
mod grid;
mod rate_limit;
mod registry;
mod routes;
mod services;
mod state;

use std::sync::Arc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    // Fatal configuration problems surface before the listener opens.
    let config = Arc::new(config::ServerConfig::from_env().expect("configuration error"));
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");

    let pool = db::init_pool(&database_url)
        .await
        .expect("database init failed");

    let state = state::AppState::new(pool, Arc::clone(&config));
    state
        .registry
        .ensure_canonical()
        .await
        .expect("canonical room bootstrap failed");

    let app = routes::app(state);
    let bind = format!("{}:{}", config.listen_address, config.listen_port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .expect("failed to bind");

    tracing::info!(address = %bind, canonical = %config.canonical_slug, "plaza listening");
    axum::serve(listener, app).await.expect("server failed");
}
