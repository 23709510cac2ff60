pub mod health;
pub mod jobs;
pub mod metrics;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::services::orchestrator::OrchestratorError;
use crate::services::state_machine::StateError;
use crate::services::storage::StorageError;

/// Build the HTTP router. `/metrics` is only mounted when a Prometheus
/// recorder has been installed.
pub fn router(state: AppState, prometheus: Option<Arc<PrometheusHandle>>, max_upload_bytes: usize) -> Router {
    let mut app = Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/jobs", get(jobs::list_jobs).post(jobs::submit_job))
        .route("/api/v1/jobs/{id}", get(jobs::get_job).delete(jobs::delete_job))
        .route("/api/v1/jobs/{id}/events", get(jobs::job_events))
        .route("/api/v1/jobs/{id}/outputs/{*name}", get(jobs::download_output))
        .route("/api/v1/jobs/{id}/cancel", post(jobs::cancel_job))
        .with_state(state);

    if let Some(handle) = prometheus {
        app = app.route("/metrics", get(metrics::render_metrics).with_state(handle));
    }

    app.layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Error returned by handlers, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

impl From<StateError> for ApiError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, err.to_string()),
            StateError::Repository(e) => {
                tracing::error!(error = %e, "Job repository error");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "job store unavailable")
            }
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Invalid(report) => ApiError::new(StatusCode::BAD_REQUEST, report.to_string()),
            OrchestratorError::State(e) => e.into(),
            OrchestratorError::OutputNotFound { .. } | OrchestratorError::Storage(StorageError::NotFound(_)) => {
                ApiError::new(StatusCode::NOT_FOUND, err.to_string())
            }
            OrchestratorError::Storage(e) => {
                tracing::error!(error = %e, "Blob store error");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "blob store unavailable")
            }
            OrchestratorError::Workspace(e) => {
                tracing::error!(error = %e, "Workspace error");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}
