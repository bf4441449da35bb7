use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::jobs::JobError;
use crate::models::job::{JobKind, StatusRecord};
use crate::models::responses::CleanupResponse;

#[derive(Serialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub status: String,
}

/// GET /status/{job_id}
pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<StatusRecord>, JobError> {
    Ok(Json(state.engine.status(job_id)?))
}

/// GET /batch_status/{batch_id}: only batch jobs resolve here.
pub async fn batch_status(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<StatusRecord>, JobError> {
    let record = state.engine.status(batch_id)?;
    if record.kind != JobKind::Batch {
        return Err(JobError::NotFound(batch_id));
    }
    Ok(Json(record))
}

/// POST /cancel/{job_id}
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<CancelResponse>), JobError> {
    state.engine.cancel(job_id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            job_id,
            status: "cancelling".to_string(),
        }),
    ))
}

/// DELETE /cleanup/{file_id}: remove every artifact of a job or batch and its status.
pub async fn cleanup(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
) -> Result<Json<CleanupResponse>, JobError> {
    let removed = state.engine.cleanup(file_id).await?;
    let removed_files: Vec<String> = removed.into_iter().map(|artifact| artifact.key).collect();
    Ok(Json(CleanupResponse {
        success: true,
        file_id,
        message: format!("Cleaned up {} files", removed_files.len()),
        removed_files,
    }))
}
