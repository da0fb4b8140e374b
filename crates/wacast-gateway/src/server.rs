//! HTTP server implementation using Axum.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use wacast_core::config::GatewayConfig;
use wacast_core::error::Result;
use wacast_store::DurableStore;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub store: DurableStore,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(super::routes::health_check))
        .route("/api/jobs", get(super::routes::list_jobs))
        .route("/api/jobs", post(super::routes::create_job))
        .route("/api/jobs/{id}/cancel", post(super::routes::cancel_job))
        .route("/api/jobs/clear-completed", post(super::routes::clear_completed))
        .route("/api/wa/status", get(super::routes::wa_status))
        .route("/api/log", get(super::routes::recent_log))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Bind and serve until the process exits.
pub async fn serve(config: &GatewayConfig, store: DurableStore) -> Result<()> {
    store.ensure_exists()?;
    let router = build_router(AppState { store });
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("gateway listening on http://{addr}");
    axum::serve(listener, router).await?;
    Ok(())
}
