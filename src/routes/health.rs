use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub model_name: String,
    pub storage_backend: String,
    pub checks: HealthChecks,
    pub active_jobs: usize,
    pub tracked_jobs: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub detector: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

/// GET /
pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "YOLO Detection API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

/// GET /health: service status with detector reachability.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let engine = &state.engine;
    let start = std::time::Instant::now();

    let detector_check = match engine.detector().health_check().await {
        Ok(()) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Detector health check failed");
            ComponentHealth {
                status: "error".to_string(),
                latency_ms: None,
            }
        }
    };

    let healthy = detector_check.status == "ok";
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model_name: engine.detector().profile().model_name.clone(),
        storage_backend: engine.store().backend().to_string(),
        checks: HealthChecks {
            detector: detector_check,
        },
        active_jobs: engine.registry().active(),
        tracked_jobs: engine.registry().len(),
        timestamp: Utc::now(),
    };

    (status_code, Json(response))
}

/// GET /classes: class names the active model reports.
pub async fn classes(State(state): State<AppState>) -> Json<Value> {
    let names = &state.engine.detector().profile().class_names;
    Json(json!({
        "classes": names,
        "total": names.len(),
    }))
}
