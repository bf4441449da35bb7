use axum::extract::State;
use axum::response::IntoResponse;

use crate::app_state::MetricsState;

/// GET /metrics: job counters, frame counts and job durations in Prometheus text format.
pub async fn prometheus_metrics(State(handle): State<MetricsState>) -> impl IntoResponse {
    handle.render()
}
