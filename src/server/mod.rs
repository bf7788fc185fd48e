//! HTTP ingress for kobold.
//!
//! # Endpoints
//!
//! - `POST /events/{channel}` - Buffers the raw body as an event on `channel` (returns 202 Accepted)
//! - `GET /api/v1/tasks` - Lists tasks as JSON, optionally filtered by `?status=`
//! - `GET /api/v1/tasks/{id}` - One task, 404 if unknown
//! - `GET /api/v1/channels` - Catalog channels
//! - `GET /api/v1/pipelines` - Catalog pipelines
//! - `GET /api/v1/pipelines/{name}` - One pipeline, 404 if unknown
//! - `GET /metrics` - Prometheus text exposition
//! - `GET /health` - Returns 200 if server is running

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use metrics_exporter_prometheus::PrometheusHandle;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::scheduler::{ScheduleError, Scheduler, SchedulerError, SchedulerHandle};
use crate::store::{Catalog, StoreError, TaskStore};

pub mod catalog;
pub mod events;
pub mod health;
pub mod tasks;

pub use catalog::{channels_handler, pipeline_handler, pipelines_handler};
pub use events::event_handler;
pub use health::{health_handler, metrics_handler};
pub use tasks::{task_handler, tasks_handler};

/// Errors returned by the HTTP handlers.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0}")]
    Schedule(#[from] ScheduleError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("metrics are not enabled")]
    MetricsDisabled,

    #[error("{0} not found")]
    NotFound(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Schedule(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::MetricsDisabled | ServerError::NotFound(_) => StatusCode::NOT_FOUND,
        };

        (status, self.to_string()).into_response()
    }
}

/// Shared application state.
///
/// Passed to all handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    scheduler: SchedulerHandle,
    store: Arc<dyn TaskStore>,
    catalog: Arc<Catalog>,
    prometheus: Option<PrometheusHandle>,
    /// Cancelled on shutdown; requests waiting for ingress space give up.
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        scheduler: SchedulerHandle,
        store: Arc<dyn TaskStore>,
        catalog: Arc<Catalog>,
        prometheus: Option<PrometheusHandle>,
        shutdown: CancellationToken,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                scheduler,
                store,
                catalog,
                prometheus,
                shutdown,
            }),
        }
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.inner.scheduler
    }

    pub fn store(&self) -> &dyn TaskStore {
        self.inner.store.as_ref()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn prometheus(&self) -> Option<&PrometheusHandle> {
        self.inner.prometheus.as_ref()
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.inner.shutdown
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/events/{channel}", post(event_handler))
        .route("/api/v1/tasks", get(tasks_handler))
        .route("/api/v1/tasks/{id}", get(task_handler))
        .route("/api/v1/channels", get(channels_handler))
        .route("/api/v1/pipelines", get(pipelines_handler))
        .route("/api/v1/pipelines/{name}", get(pipeline_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}

/// Errors that end [`serve`].
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("http server: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("scheduler task panicked: {0}")]
    Join(#[from] JoinError),
}

/// Runs the scheduler loop and the HTTP server until `shutdown` fires or the
/// scheduler stops on its own.
///
/// A scheduler that stops with an error cancels `shutdown`, so the server
/// drains and the error is returned instead of the process serving events
/// nobody will ever dispatch.
pub async fn serve(
    listener: TcpListener,
    app: axum::Router,
    scheduler: Scheduler,
    debounce: Duration,
    shutdown: CancellationToken,
) -> Result<(), ServeError> {
    let stop = shutdown.clone();
    let scheduler_task = tokio::spawn(async move {
        let result = scheduler.run(debounce).await;
        if let Err(e) = &result {
            error!(error = %e, "scheduler stopped, shutting down");
        }
        stop.cancel();
        result
    });

    let signal = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .await;

    shutdown.cancel();
    scheduler_task.await??;
    served?;
    info!("server stopped");
    Ok(())
}
