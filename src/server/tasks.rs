//! Read-only task listing.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;

use super::{AppState, ServerError};
use crate::types::{Task, TaskId, TaskStatus};

#[derive(Debug, Default, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
}

/// Lists every task in insertion order.
///
/// ```ignore
/// GET /api/v1/tasks?status=failure HTTP/1.1
///
/// HTTP/1.1 200 OK
/// Content-Type: application/json
///
/// [{"id": "...", "status": "failure", "failure_reason": "...", ...}]
/// ```
pub async fn tasks_handler(
    State(app_state): State<AppState>,
    Query(filter): Query<TaskFilter>,
) -> Result<Json<Vec<Task>>, ServerError> {
    let mut tasks = app_state.store().tasks_list().await?;
    if let Some(status) = filter.status {
        tasks.retain(|t| t.status == status);
    }
    Ok(Json(tasks))
}

/// Returns one task, or 404 if no task has that id.
pub async fn task_handler(
    State(app_state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ServerError> {
    let id = TaskId::from(id);
    app_state
        .store()
        .tasks_list()
        .await?
        .into_iter()
        .find(|t| t.id == id)
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("task {}", id)))
}
