use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use enroll_core::RegistrationService;
use enroll_storage::{init_registration_db, SqliteRegistrationStore};

mod config;
mod http;
mod protocol;
mod websocket;

use config::ServerConfig;

/// Application state shared across all handlers.
pub struct AppState {
    pub service: Arc<RegistrationService>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    let config = ServerConfig::from_env()?;
    tracing::info!(db_path = %config.database_path, "starting registration server");

    let pool = init_registration_db(&config.database_path).await?;
    let store = Arc::new(SqliteRegistrationStore::new(pool));

    // Invalid engine configuration is fatal here, before any request is
    // accepted.
    let service = Arc::new(RegistrationService::new(store, config.engine.clone())?);
    service.load_courses().await?;

    let app_state = Arc::new(AppState {
        service: Arc::clone(&service),
    });

    let app = Router::new()
        .merge(http::create_http_router())
        .route("/ws", get(websocket::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    tracing::info!(addr = %config.bind_address, "server listening");
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
