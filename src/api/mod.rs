//! HTTP/JSON command API.

pub mod handlers;
pub mod types;

use anyhow::{anyhow, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::controller::Controller;

/// Shared state for axum handlers
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
}

pub fn router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/api/deliver", post(handlers::deliver))
        .route("/api/stop", post(handlers::stop))
        .route("/api/purge", post(handlers::purge))
        .route("/api/water", post(handlers::water))
        .route("/api/mat", post(handlers::mat))
        .route("/api/connect", post(handlers::connect))
        .route("/api/disconnect", post(handlers::disconnect))
        .route("/api/info", get(handlers::info))
        .route("/api/status", get(handlers::status))
        .route("/api/health", get(handlers::health))
        .route("/api/deliveries", get(handlers::deliveries))
        .route("/api/deliveries/{id}", get(handlers::delivery))
        .with_state(AppState { controller })
}

/// Serve the API on `bind` until `shutdown` resolves.
pub async fn serve(
    controller: Arc<Controller>,
    bind: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| anyhow!("Failed to bind HTTP server to {bind}: {err}"))?;
    log::info!("HTTP API listening on {bind}");

    axum::serve(listener, router(controller))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| anyhow!("HTTP server error: {err}"))?;

    log::info!("HTTP API stopped");
    Ok(())
}
