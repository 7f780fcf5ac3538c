//! HTTP boundary: route wiring for the chat and admin surfaces
//!
//! A thin Axum layer over the pipeline. The enclosing deployment owns
//! anything beyond these routes (TLS, auth proxies, UI).

pub mod handlers;
pub mod types;

use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::pipeline::Pipeline;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub admin_token: String,
    /// Configuration source re-read on provider reload.
    pub config_path: Option<String>,
}

/// Assemble the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat", post(handlers::chat))
        .route("/providers", get(handlers::get_providers))
        .route("/health", get(handlers::health_check))
        .route("/admin/router/set-thresholds", post(handlers::set_thresholds))
        .route("/admin/router/thresholds", get(handlers::get_thresholds))
        .route("/admin/router/reload-secrets", post(handlers::reload_providers))
        .route("/admin/router/force-override", post(handlers::force_override))
        .route("/admin/budget/reset", post(handlers::reset_budget))
        .route("/admin/budget", get(handlers::get_budget))
        .route("/admin/metrics", get(handlers::get_metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: AppState, host: &str, port: u16) -> Result<(), anyhow::Error> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let router = build_router(state);
    info!(%addr, "ds-router listening");
    axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}
