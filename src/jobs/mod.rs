//! Detection jobs: single image, video file, image batch and live stream.
//!
//! Every job kind has a `run_*` entry point that executes to completion and returns
//! the payload, and a `submit_*` entry point that registers the job, spawns it and
//! returns the identifier for polling. Both paths publish the same status records.

pub mod batch;
pub mod reporter;
pub mod single;
pub mod stream;
pub mod video;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use garde::Validate;
use image::imageops::FilterType;
use image::RgbImage;
use uuid::Uuid;

use crate::models::artifact::ArtifactRef;
use crate::models::detection::{filter_by_classes, DetectionConfig, DetectionResult};
use crate::models::job::StatusRecord;
use crate::services::detector::{DetectionCapability, DetectionError, DetectionOutput};
use crate::services::registry::StatusRegistry;
use crate::services::render;
use crate::services::storage::{ArtifactStore, StorageError};
use crate::services::video::{VideoBackend, VideoError};

pub use batch::BatchRequest;
pub use reporter::JobReporter;
pub use single::ImageRequest;
pub use stream::StreamRequest;
pub use video::VideoRequest;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Stream unavailable: {0}")]
    StreamUnavailable(String),

    #[error("Detection failed: {0}")]
    Capability(#[from] DetectionError),

    #[error("Artifact storage failed: {0}")]
    ArtifactIo(#[from] StorageError),

    #[error("Video processing failed: {0}")]
    Media(#[from] VideoError),

    #[error("Job setup failed: {0}")]
    Setup(String),

    #[error("Failed to serialize job result: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Job exceeded its time budget of {0} seconds")]
    TimedOut(u64),
}

/// Bounds applied to every submission.
#[derive(Debug, Clone)]
pub struct JobLimits {
    pub job_timeout: Duration,
    pub max_batch_files: usize,
    pub default_video_frames: u64,
    pub default_stream_frames: u64,
    pub max_frames_limit: u64,
}

impl Default for JobLimits {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(900),
            max_batch_files: 20,
            default_video_frames: 30,
            default_stream_frames: 10,
            max_frames_limit: 3000,
        }
    }
}

/// One uploaded file as received from a client.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl UploadedFile {
    pub fn new(filename: impl Into<String>, content_type: Option<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type,
            data,
        }
    }

    /// Reject empty uploads and declared content types outside `major/*`.
    pub fn ensure_kind(&self, major: &str) -> Result<(), JobError> {
        if self.data.is_empty() {
            return Err(JobError::InvalidInput(format!(
                "{} is empty",
                self.display_name()
            )));
        }
        match self.content_type.as_deref() {
            Some(declared) if !declared.starts_with(&format!("{major}/")) => {
                Err(JobError::InvalidInput(format!(
                    "{} must be an {major} file, got {declared}",
                    self.display_name()
                )))
            }
            _ => Ok(()),
        }
    }

    /// Lowercase alphanumeric extension of the client filename, if it has a usable one.
    pub fn extension(&self) -> Option<String> {
        let ext = Path::new(&self.filename).extension()?.to_str()?;
        (!ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .then(|| ext.to_ascii_lowercase())
    }

    fn display_name(&self) -> &str {
        if self.filename.is_empty() {
            "upload"
        } else {
            &self.filename
        }
    }
}

/// How long cleanup waits for a cancelled job to reach a terminal state.
pub const CLEANUP_GRACE: Duration = Duration::from_secs(10);
const CLEANUP_POLL_INTERVAL: Duration = Duration::from_millis(20);

fn validate_config(config: &DetectionConfig) -> Result<(), JobError> {
    config
        .validate()
        .map_err(|report| JobError::InvalidInput(report.to_string()))
}

/// Runs detection jobs against a detector, an artifact store and a video backend.
pub struct DetectionEngine {
    registry: Arc<StatusRegistry>,
    store: Arc<dyn ArtifactStore>,
    detector: Arc<dyn DetectionCapability>,
    video: Arc<dyn VideoBackend>,
    limits: JobLimits,
    work_dir: PathBuf,
}

impl DetectionEngine {
    pub fn new(
        registry: Arc<StatusRegistry>,
        store: Arc<dyn ArtifactStore>,
        detector: Arc<dyn DetectionCapability>,
        video: Arc<dyn VideoBackend>,
        limits: JobLimits,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            store,
            detector,
            video,
            limits,
            work_dir: work_dir.into(),
        }
    }

    pub fn registry(&self) -> &Arc<StatusRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn detector(&self) -> &Arc<dyn DetectionCapability> {
        &self.detector
    }

    pub fn limits(&self) -> &JobLimits {
        &self.limits
    }

    /// Latest status of a job. Reads never change the record.
    pub fn status(&self, job_id: Uuid) -> Result<StatusRecord, JobError> {
        self.registry.get(job_id).ok_or(JobError::NotFound(job_id))
    }

    /// Request cancellation of a running job; it stops at the next frame or file.
    pub fn cancel(&self, job_id: Uuid) -> Result<(), JobError> {
        let record = self.status(job_id)?;
        if record.status.is_terminal() || !self.registry.cancel(job_id) {
            return Err(JobError::InvalidInput(format!(
                "Job {job_id} already finished with status {}",
                record.status
            )));
        }
        tracing::info!(job_id = %job_id, "Cancellation requested");
        Ok(())
    }

    /// Delete every artifact whose key starts with `id` and forget its status.
    ///
    /// A job still running is cancelled first and given up to [`CLEANUP_GRACE`] to
    /// stop, so nothing it writes afterwards escapes the sweep. Unknown identifiers
    /// remove nothing.
    pub async fn cleanup(&self, id: Uuid) -> Result<Vec<ArtifactRef>, JobError> {
        if self.registry.cancel(id) {
            self.wait_until_stopped(id).await;
        }

        let artifacts = self.store.list_by_prefix(&id.to_string()).await?;
        for artifact in &artifacts {
            match self.store.delete(artifact).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if let Err(e) = self.store.remove_namespace(&format!("{id}/")).await {
            tracing::warn!(id = %id, error = %e, "Failed to remove batch namespace");
        }

        let had_status = self.registry.remove(id);
        tracing::info!(
            id = %id,
            removed = artifacts.len(),
            had_status,
            "Cleaned up job artifacts"
        );
        Ok(artifacts)
    }

    async fn wait_until_stopped(&self, id: Uuid) {
        let deadline = Instant::now() + CLEANUP_GRACE;
        while Instant::now() < deadline {
            match self.registry.get(id) {
                Some(record) if !record.status.is_terminal() => {
                    tokio::time::sleep(CLEANUP_POLL_INTERVAL).await;
                }
                _ => return,
            }
        }
        tracing::warn!(id = %id, "Job still running after cancellation, cleaning up anyway");
    }

    /// Run `work` under the wall-clock budget, recording metrics and writing the
    /// terminal `error` record on failure. Success records are written by the job.
    async fn drive<T, F>(&self, reporter: &JobReporter, work: F) -> Result<T, JobError>
    where
        F: Future<Output = Result<T, JobError>>,
    {
        let kind = reporter.kind().to_string();
        let started = Instant::now();
        metrics::counter!("detection_jobs_total", "kind" => kind.clone()).increment(1);
        metrics::gauge!("detection_jobs_active").increment(1.0);

        let outcome = match tokio::time::timeout(self.limits.job_timeout, work).await {
            Ok(outcome) => outcome,
            Err(_) => Err(JobError::TimedOut(self.limits.job_timeout.as_secs())),
        };

        metrics::gauge!("detection_jobs_active").decrement(1.0);
        metrics::histogram!("detection_job_seconds", "kind" => kind.clone())
            .record(started.elapsed().as_secs_f64());

        match &outcome {
            Ok(_) => {
                metrics::counter!("detection_jobs_completed", "kind" => kind).increment(1);
                tracing::info!(
                    job_id = %reporter.job_id(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job completed"
                );
            }
            Err(e) => {
                metrics::counter!("detection_jobs_failed", "kind" => kind).increment(1);
                tracing::error!(job_id = %reporter.job_id(), error = %e, "Job failed");
                reporter.fail(e);
            }
        }
        outcome
    }

    /// Detect on one frame and apply the allow-list and frame bounds to the result.
    async fn detect_frame(
        &self,
        frame: &RgbImage,
        config: &DetectionConfig,
    ) -> Result<(Vec<DetectionResult>, RgbImage), JobError> {
        let output = self.detector.detect(frame, config).await?;
        Ok(finalize_detections(output, frame, config))
    }
}

/// Filter to the allow-list and clamp boxes into the frame, re-rendering the overlay
/// when anything changed so the annotated image shows exactly the kept detections.
pub(crate) fn finalize_detections(
    output: DetectionOutput,
    frame: &RgbImage,
    config: &DetectionConfig,
) -> (Vec<DetectionResult>, RgbImage) {
    let (width, height) = frame.dimensions();
    let original_len = output.detections.len();
    let kept: Vec<DetectionResult> = filter_by_classes(output.detections.clone(), config)
        .into_iter()
        .filter_map(|d| {
            d.bbox.clamped(width, height).map(|bbox| DetectionResult { bbox, ..d })
        })
        .collect();

    let unchanged = kept.len() == original_len && kept == output.detections;
    let annotated = if unchanged {
        fit_frame(output.annotated, width, height)
    } else {
        render::annotate(frame, &kept)
    };
    (kept, annotated)
}

/// Resize to `width x height` unless it already matches.
pub(crate) fn fit_frame(image: RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        image
    } else {
        image::imageops::resize(&image, width, height, FilterType::Triangle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class_name: &str, bbox: [f32; 4]) -> DetectionResult {
        DetectionResult {
            class_name: class_name.to_string(),
            confidence: 0.8,
            bbox: bbox.into(),
        }
    }

    #[test]
    fn test_finalize_clamps_and_filters() {
        let frame = RgbImage::new(100, 50);
        let output = DetectionOutput {
            detections: vec![
                det("person", [-5.0, 10.0, 120.0, 40.0]),
                det("car", [10.0, 10.0, 20.0, 20.0]),
                det("person", [200.0, 200.0, 300.0, 300.0]),
            ],
            annotated: frame.clone(),
        };
        let config = DetectionConfig {
            class_filter: Some(vec!["person".to_string()]),
            ..DetectionConfig::default()
        };

        let (kept, annotated) = finalize_detections(output, &frame, &config);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].bbox, [0.0, 10.0, 100.0, 40.0].into());
        assert!(kept.iter().all(|d| d.bbox.within(100, 50)));
        assert_eq!(annotated.dimensions(), (100, 50));
    }

    #[test]
    fn test_fit_frame_resizes_mismatch() {
        let resized = fit_frame(RgbImage::new(10, 10), 20, 8);
        assert_eq!(resized.dimensions(), (20, 8));
    }

    #[test]
    fn test_ensure_kind() {
        let ok = UploadedFile::new("a.png", Some("image/png".to_string()), vec![1]);
        assert!(ok.ensure_kind("image").is_ok());

        let undeclared = UploadedFile::new("a.bin", None, vec![1]);
        assert!(undeclared.ensure_kind("image").is_ok());

        let wrong = UploadedFile::new("a.mp4", Some("video/mp4".to_string()), vec![1]);
        assert!(matches!(wrong.ensure_kind("image"), Err(JobError::InvalidInput(_))));

        let empty = UploadedFile::new("a.png", None, Vec::new());
        assert!(matches!(empty.ensure_kind("image"), Err(JobError::InvalidInput(_))));
    }

    #[test]
    fn test_extension_sanitized() {
        let file = |name: &str| UploadedFile::new(name, None, vec![1]);
        assert_eq!(file("clip.MP4").extension(), Some("mp4".to_string()));
        assert_eq!(file("noext").extension(), None);
        assert_eq!(file("weird.p/ng").extension(), None);
        assert_eq!(file("long.abcdefg").extension(), None);
    }
}
