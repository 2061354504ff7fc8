//! Control surface: Axum HTTP API over the loop controller.
//!
//! Session, start/stop and read-only views of the loop and the brokerage.
//! CORS is open so a local UI can drive it.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use routes::AppState;

/// Bind the control surface and serve it on a background task.
pub async fn spawn_dashboard(state: AppState, port: u16) -> Result<JoinHandle<()>> {
    let app = build_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind control surface on port {port}"))?;

    info!(port, "Control surface listening on http://localhost:{port}");
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Control surface stopped");
        }
    }))
}

/// Build the router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/auth", post(routes::authenticate))
        .route("/start", post(routes::start))
        .route("/stop", post(routes::stop))
        .route("/status", get(routes::get_status))
        .route("/progress", get(routes::get_progress))
        .route("/positions", get(routes::get_positions))
        .route("/orders", get(routes::get_orders))
        .route("/account", get(routes::get_account))
        .route("/trade_history", get(routes::get_trade_history))
        .route("/decisions", get(routes::get_decisions))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
