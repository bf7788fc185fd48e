//! Read-only views of the routing catalog.

use axum::Json;
use axum::extract::{Path, State};

use super::{AppState, ServerError};
use crate::store::{Channel, Pipeline};

pub async fn channels_handler(State(app_state): State<AppState>) -> Json<Vec<Channel>> {
    Json(app_state.catalog().channels.clone())
}

pub async fn pipelines_handler(State(app_state): State<AppState>) -> Json<Vec<Pipeline>> {
    Json(app_state.catalog().pipelines.clone())
}

/// Returns one pipeline by name.
///
/// ```ignore
/// GET /api/v1/pipelines/infra HTTP/1.1
///
/// HTTP/1.1 200 OK
/// Content-Type: application/json
///
/// {"name": "infra", "repo_uri": "https://git.example.com/infra?ref=main", "channels": ["hub"], ...}
/// ```
pub async fn pipeline_handler(
    State(app_state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Pipeline>, ServerError> {
    app_state
        .catalog()
        .pipelines
        .iter()
        .find(|p| p.name == name)
        .cloned()
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("pipeline {}", name)))
}
