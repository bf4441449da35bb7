pub mod detect;
pub mod health;
pub mod metrics;
pub mod status;

use std::path::PathBuf;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::services::ServeDir;

use crate::app_state::{AppState, MetricsState};
use crate::jobs::JobError;

impl JobError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            JobError::InvalidInput(_) | JobError::StreamUnavailable(_) => StatusCode::BAD_REQUEST,
            JobError::NotFound(_) => StatusCode::NOT_FOUND,
            JobError::Cancelled => StatusCode::CONFLICT,
            JobError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
            JobError::Capability(_)
            | JobError::ArtifactIo(_)
            | JobError::Media(_)
            | JobError::Setup(_)
            | JobError::Serialize(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for JobError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

/// Build the HTTP router. `outputs_dir` is served under `/outputs` for the local backend.
pub fn router(state: AppState, metrics: MetricsState, outputs_dir: Option<PathBuf>) -> Router {
    let body_limit = state.max_upload_bytes;

    let mut app = Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health_check))
        .route("/classes", get(health::classes))
        .route("/predict", post(detect::predict))
        .route("/predict_video", post(detect::predict_video))
        .route("/predict_batch", post(detect::predict_batch))
        .route("/predict_stream", post(detect::predict_stream))
        .route("/status/{job_id}", get(status::job_status))
        .route("/batch_status/{batch_id}", get(status::batch_status))
        .route("/cancel/{job_id}", post(status::cancel_job))
        .route("/cleanup/{file_id}", delete(status::cleanup))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(metrics),
        );

    if let Some(dir) = outputs_dir {
        app = app.nest_service("/outputs", ServeDir::new(dir));
    }
    app
}
