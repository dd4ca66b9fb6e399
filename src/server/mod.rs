/// API server for content-anchor.
///
/// The server is a thin adapter in front of the orchestrator. It:
/// - Validates request schemas before any side effect
/// - Starts anchor operations and waits for their outcome
/// - Maps failures to status codes and a uniform error body
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::anchor::AnchorOrchestrator;

/// Shared application state available to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<AnchorOrchestrator>,
}

/// Build the Axum application with all routes and middleware.
pub fn build_app(state: AppState, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::health_routes())
        .merge(routes::anchor_routes())
        .merge(routes::content_routes())
        .merge(routes::query_routes())
        .with_state(Arc::new(state))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Start the API server and run until Ctrl-C.
pub async fn serve(state: AppState, addr: &str, max_upload_bytes: usize) -> std::io::Result<()> {
    let app = build_app(state, max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("content-anchor API server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            warn!(error = %e, "Cannot listen for Ctrl-C, running until killed");
            std::future::pending::<()>().await;
        }
    }
}
