use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::jobs::DetectionEngine;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DetectionEngine>,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(engine: DetectionEngine, max_upload_bytes: usize) -> Self {
        Self {
            engine: Arc::new(engine),
            max_upload_bytes,
        }
    }
}

/// State for the metrics scrape route, kept apart from the job state.
pub type MetricsState = Arc<PrometheusHandle>;
