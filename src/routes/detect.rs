use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::jobs::{
    BatchRequest, ImageRequest, JobError, StreamRequest, UploadedFile, VideoRequest,
};
use crate::models::detection::{
    DetectionConfig, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_IOU_THRESHOLD,
};
use crate::models::job::{JobKind, JobState};
use crate::models::responses::SubmitResponse;

/// Fields shared by every detection form. Unknown fields are ignored.
#[derive(Debug)]
pub struct DetectForm {
    pub files: Vec<UploadedFile>,
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub selected_classes: Option<Vec<String>>,
    pub max_frames: Option<u64>,
    pub stream_url: Option<String>,
    /// Hold the request open until the job finishes (the default), or return 202 at once.
    pub wait: bool,
}

impl Default for DetectForm {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            conf_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            selected_classes: None,
            max_frames: None,
            stream_url: None,
            wait: true,
        }
    }
}

impl DetectForm {
    pub async fn read(mut multipart: Multipart) -> Result<Self, JobError> {
        let mut form = DetectForm::default();

        while let Some(field) = multipart.next_field().await.map_err(invalid)? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" | "files" => {
                    let filename = field.file_name().unwrap_or_default().to_string();
                    let content_type = field.content_type().map(str::to_string);
                    let data = field.bytes().await.map_err(invalid)?;
                    let file = UploadedFile::new(filename, content_type, data.to_vec());
                    form.files.push(file);
                }
                "conf_threshold" => {
                    form.conf_threshold = parse_number(&name, &text(field).await?)?;
                }
                "iou_threshold" => {
                    form.iou_threshold = parse_number(&name, &text(field).await?)?;
                }
                "max_frames" => {
                    form.max_frames = Some(parse_number(&name, &text(field).await?)?);
                }
                "selected_classes" => form.selected_classes = parse_classes(&text(field).await?),
                "stream_url" => form.stream_url = Some(text(field).await?),
                "wait" => form.wait = parse_flag(&text(field).await?)?,
                _ => {}
            }
        }
        Ok(form)
    }

    pub fn config(&self) -> DetectionConfig {
        DetectionConfig {
            confidence_threshold: self.conf_threshold,
            iou_threshold: self.iou_threshold,
            class_filter: self.selected_classes.clone(),
        }
    }

    fn take_single_file(&mut self) -> Result<UploadedFile, JobError> {
        match self.files.len() {
            0 => Err(JobError::InvalidInput("No file provided".to_string())),
            1 => Ok(self.files.remove(0)),
            n => Err(JobError::InvalidInput(format!("Expected one file, got {n}"))),
        }
    }
}

fn invalid(e: axum::extract::multipart::MultipartError) -> JobError {
    JobError::InvalidInput(format!("Malformed form data: {e}"))
}

async fn text(field: axum::extract::multipart::Field<'_>) -> Result<String, JobError> {
    field.text().await.map_err(invalid)
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, JobError> {
    raw.trim()
        .parse()
        .map_err(|_| JobError::InvalidInput(format!("{name} must be a number, got {raw:?}")))
}

fn parse_flag(raw: &str) -> Result<bool, JobError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(JobError::InvalidInput(format!(
            "wait must be true or false, got {other:?}"
        ))),
    }
}

/// A JSON array of names, or a comma-separated list. Empty means no filter.
pub fn parse_classes(raw: &str) -> Option<Vec<String>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let classes: Vec<String> = match serde_json::from_str::<Vec<String>>(raw) {
        Ok(list) => list
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect(),
        Err(_) => raw
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect(),
    };
    (!classes.is_empty()).then_some(classes)
}

fn accepted(job_id: Uuid, kind: JobKind) -> Response {
    let status_url = match kind {
        JobKind::Batch => format!("/batch_status/{job_id}"),
        _ => format!("/status/{job_id}"),
    };
    let body = SubmitResponse {
        job_id,
        kind,
        status: JobState::Processing.to_string(),
        status_url,
    };
    (StatusCode::ACCEPTED, Json(body)).into_response()
}

/// POST /predict: detect objects in one image.
pub async fn predict(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, JobError> {
    let mut form = DetectForm::read(multipart).await?;
    let request = ImageRequest::new(form.take_single_file()?, form.config());

    if form.wait {
        Ok(Json(state.engine.run_image(request).await?).into_response())
    } else {
        let job_id = state.engine.submit_image(request)?;
        Ok(accepted(job_id, JobKind::Image))
    }
}

/// POST /predict_video: annotate up to `max_frames` frames of a video.
pub async fn predict_video(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, JobError> {
    let mut form = DetectForm::read(multipart).await?;
    let request = VideoRequest::new(form.take_single_file()?, form.config(), form.max_frames);

    if form.wait {
        Ok(Json(state.engine.run_video(request).await?).into_response())
    } else {
        let job_id = state.engine.submit_video(request)?;
        Ok(accepted(job_id, JobKind::Video))
    }
}

/// POST /predict_batch: detect objects in several images under one batch id.
pub async fn predict_batch(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, JobError> {
    let mut form = DetectForm::read(multipart).await?;
    let files = std::mem::take(&mut form.files);
    let request = BatchRequest::new(files, form.config());

    if form.wait {
        Ok(Json(state.engine.run_batch(request).await?).into_response())
    } else {
        let batch_id = state.engine.submit_batch(request)?;
        Ok(accepted(batch_id, JobKind::Batch))
    }
}

/// POST /predict_stream: sample frames from a live stream.
pub async fn predict_stream(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, JobError> {
    let form = DetectForm::read(multipart).await?;
    let stream_url = form
        .stream_url
        .clone()
        .ok_or_else(|| JobError::InvalidInput("stream_url is required".to_string()))?;
    let request = StreamRequest::new(stream_url, form.config(), form.max_frames);

    if form.wait {
        Ok(Json(state.engine.run_stream(request).await?).into_response())
    } else {
        let job_id = state.engine.submit_stream(request)?;
        Ok(accepted(job_id, JobKind::Stream))
    }
}
