//! Event ingress endpoint.
//!
//! The body is handed to the scheduler untouched. Decoding and persistence
//! happen later on the scheduler loop, so a 202 means the event was
//! buffered, not that it produced any tasks.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use tracing::debug;

use super::{AppState, ServerError};

/// Event handler.
///
/// # Response
///
/// - 202 Accepted: event buffered
/// - 503 Service Unavailable: the scheduler is shutting down
///
/// # Example
///
/// ```ignore
/// POST /events/dockerhub HTTP/1.1
///
/// {"repository": {"repo_name": "library/nginx"}, "push_data": {"tag": "1.27"}}
///
/// HTTP/1.1 202 Accepted
/// ```
pub async fn event_handler(
    State(app_state): State<AppState>,
    Path(channel): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, &'static str), ServerError> {
    debug!(channel = %channel, bytes = body.len(), "received event");

    app_state
        .scheduler()
        .schedule(app_state.shutdown(), channel, body.to_vec())
        .await?;

    Ok((StatusCode::ACCEPTED, "Accepted"))
}
