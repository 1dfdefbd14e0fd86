//! Stream control routes.

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};

use crate::api::error::ApiResult;
use crate::api::models::MessageResponse;
use crate::api::server::AppState;
use crate::broadcast::StatusSnapshot;
use crate::config::ConfigUpdate;

/// Create the stream control router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/config", post(update_config))
        .route("/api/stream/start", post(start_stream))
        .route("/api/stream/stop", post(stop_stream))
}

/// Current state, configuration and last error.
async fn get_status(State(state): State<AppState>) -> ApiResult<Json<StatusSnapshot>> {
    Ok(Json(state.supervisor.status().await?))
}

/// Replace the output destination.
async fn update_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> ApiResult<Json<MessageResponse>> {
    let message = state.supervisor.set_config(update).await?;
    Ok(Json(MessageResponse::new(message)))
}

/// Probe the input and start the encoder. Resolves once live.
async fn start_stream(State(state): State<AppState>) -> ApiResult<Json<MessageResponse>> {
    let message = state.supervisor.start().await?;
    Ok(Json(MessageResponse::new(message)))
}

/// Stop the encoder. Resolves once it has exited.
async fn stop_stream(State(state): State<AppState>) -> ApiResult<Json<MessageResponse>> {
    let message = state.supervisor.stop().await?;
    Ok(Json(MessageResponse::new(message)))
}
