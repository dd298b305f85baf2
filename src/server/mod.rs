//! # HTTP Facade
//!
//! JSON endpoints the dashboard polls for printer status and uses to edit
//! the printer connection and log into the cloud account.
//!
//! ## Routes
//!
//! ```text
//! GET  /api/3dprint/config        current printer config
//! POST /api/3dprint/config        merge + persist, then reconnect
//! GET  /api/3dprint/status        latest cached status, 204 before the first report
//! GET  /api/3dprint/link          device link diagnostics
//! POST /api/3dprint/reconnect     rebuild the device session from the current config
//! GET  /api/3dprint/model         latest cloud print task
//! GET  /api/3dprint/token-status  whether a valid cloud token is stored
//! POST /api/3dprint/login         cloud login
//! POST /api/3dprint/verify        finish login with an e-mailed code
//! ```

mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use color_eyre::{eyre::eyre, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::relay::RelayService;

pub fn router(relay: Arc<RelayService>) -> Router {
    Router::new()
        .route(
            "/api/3dprint/config",
            get(handlers::printer::get_config).post(handlers::printer::update_config),
        )
        .route("/api/3dprint/status", get(handlers::printer::status))
        .route("/api/3dprint/link", get(handlers::printer::link))
        .route("/api/3dprint/reconnect", post(handlers::printer::reconnect))
        .route("/api/3dprint/model", get(handlers::account::model))
        .route("/api/3dprint/token-status", get(handlers::account::token_status))
        .route("/api/3dprint/login", post(handlers::account::login))
        .route("/api/3dprint/verify", post(handlers::account::verify))
        .layer(TraceLayer::new_for_http())
        .with_state(relay)
}

/// Serves the API until `shutdown` is cancelled.
pub async fn serve(
    relay: Arc<RelayService>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| eyre!("Failed to bind to {}: {}", addr, e))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, router(relay))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| eyre!("Server error: {}", e))?;

    info!("HTTP server stopped");
    Ok(())
}
