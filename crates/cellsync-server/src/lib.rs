pub mod api;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::session::{SessionManager, SessionSettings};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
}

/// Build the HTTP router: REST API plus WebSocket sessions
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(api::router())
        .merge(transport::websocket::router())
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
        .with_state(state)
}

/// Run the server with the given configuration
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let sessions = Arc::new(SessionManager::new(SessionSettings::from(&config)));

    match &config.data_dir {
        Some(dir) => tracing::info!("Saving spreadsheets to {}", dir.display()),
        None => tracing::info!("DATA_DIR not set, spreadsheets are kept in memory only"),
    }

    // Raw TCP session listener
    let session_addr = format!("{}:{}", config.host, config.session_port);
    let session_listener = TcpListener::bind(&session_addr).await?;
    tracing::info!("Session listener on {}", session_addr);
    tokio::spawn(transport::tcp::serve(session_listener, sessions.clone()));

    // Build the router
    let app = app(AppState {
        sessions: sessions.clone(),
    });

    // Start the server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sessions.save_all().await;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
