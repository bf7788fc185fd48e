//! Liveness and metrics endpoints.

use axum::extract::State;
use axum::http::StatusCode;

use super::{AppState, ServerError};

/// Returns 200 OK with the text "OK" while the server is accepting
/// connections.
pub async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Renders every recorded metric in the Prometheus text format.
pub async fn metrics_handler(State(app_state): State<AppState>) -> Result<String, ServerError> {
    app_state
        .prometheus()
        .map(|handle| handle.render())
        .ok_or(ServerError::MetricsDisabled)
}
