//! API route modules.
//!
//! Organizes routes by resource type.

pub mod health;
pub mod logging;
pub mod stream;
pub mod ws;

use axum::Router;

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(stream::router())
        .merge(ws::router())
        .nest("/api/health", health::router())
        .nest("/api/logging", logging::router())
        .with_state(state)
}
