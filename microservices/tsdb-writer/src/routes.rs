//! Router configuration for TSDB Writer API

use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers;
use crate::AppState;

/// Create the main router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Metrics
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/stats", get(handlers::stats))
        // Writes
        .route("/api/v1/write", post(handlers::write))
        .route("/api/v1/resend", post(handlers::resend))
        .with_state(state)
}
