use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::jobs::{fit_frame, validate_config, DetectionEngine, JobError, JobReporter, UploadedFile};
use crate::models::artifact::{ArtifactKind, ArtifactNames};
use crate::models::detection::{DetectionConfig, FrameResult};
use crate::models::job::JobKind;
use crate::models::responses::{
    class_counts, count_frame_detections, Parameters, VideoInfo, VideoJobResult,
};
use crate::services::video::{FrameSink, VideoCodec, VideoError, VideoProperties};

#[derive(Debug, Clone)]
pub struct VideoRequest {
    pub job_id: Uuid,
    pub file: UploadedFile,
    pub config: DetectionConfig,
    /// Upper bound on frames to process; the engine default when `None`.
    pub max_frames: Option<u64>,
}

impl VideoRequest {
    pub fn new(file: UploadedFile, config: DetectionConfig, max_frames: Option<u64>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            file,
            config,
            max_frames,
        }
    }
}

/// Frames the loop will attempt: `max_frames`, or fewer when the container declares
/// a shorter length. An undeclared length (0) means "until the source ends".
fn frame_budget(max_frames: u64, total_frames: u64) -> u64 {
    if total_frames == 0 {
        max_frames
    } else {
        max_frames.min(total_frames)
    }
}

/// Map processed frames onto the 60..=90 progress band.
fn frame_progress(done: u64, budget: u64) -> u8 {
    if budget == 0 {
        return 90;
    }
    (60 + 30 * done.min(budget) / budget) as u8
}

impl DetectionEngine {
    fn video_max_frames(&self, requested: Option<u64>) -> Result<u64, JobError> {
        let max_frames = requested.unwrap_or(self.limits.default_video_frames);
        if max_frames == 0 || max_frames > self.limits.max_frames_limit {
            return Err(JobError::InvalidInput(format!(
                "max_frames must be between 1 and {}",
                self.limits.max_frames_limit
            )));
        }
        Ok(max_frames)
    }

    fn validate_video(&self, request: &VideoRequest) -> Result<u64, JobError> {
        validate_config(&request.config)?;
        request.file.ensure_kind("video")?;
        self.video_max_frames(request.max_frames)
    }

    /// Detect objects frame by frame, write an annotated video and wait for the result.
    pub async fn run_video(&self, request: VideoRequest) -> Result<VideoJobResult, JobError> {
        let max_frames = self.validate_video(&request)?;
        let reporter = JobReporter::start(self.registry.clone(), request.job_id, JobKind::Video);
        self.execute_video(&reporter, request, max_frames).await
    }

    pub fn submit_video(self: &Arc<Self>, request: VideoRequest) -> Result<Uuid, JobError> {
        let max_frames = self.validate_video(&request)?;
        let job_id = request.job_id;
        let reporter = JobReporter::start(self.registry.clone(), job_id, JobKind::Video);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let _ = engine.execute_video(&reporter, request, max_frames).await;
        });
        Ok(job_id)
    }

    async fn execute_video(
        &self,
        reporter: &JobReporter,
        request: VideoRequest,
        max_frames: u64,
    ) -> Result<VideoJobResult, JobError> {
        self.drive(reporter, async {
            let result = self.process_video(reporter, &request, max_frames).await?;
            let message = format!(
                "Processed {} frames, {} detections",
                result.video_info.processed_frames, result.total_detections
            );
            let processed = result.video_info.processed_frames;
            reporter.complete(message, serde_json::to_value(&result)?, |record| {
                record.processed_frames = Some(processed);
            });
            Ok(result)
        })
        .await
    }

    async fn process_video(
        &self,
        reporter: &JobReporter,
        request: &VideoRequest,
        max_frames: u64,
    ) -> Result<VideoJobResult, JobError> {
        let names = ArtifactNames::for_job(request.job_id);

        // Decoders and encoders need real paths, so the upload is staged in a
        // per-job scratch directory that is removed when this function returns.
        let scratch = tempfile::Builder::new()
            .prefix("media-detect-")
            .tempdir_in(&self.work_dir)
            .map_err(|e| JobError::Setup(format!("failed to create scratch directory: {e}")))?;
        let input_ext = request.file.extension().unwrap_or_else(|| "mp4".to_string());
        let input_path = scratch.path().join(names.input(&input_ext));
        tokio::fs::write(&input_path, &request.file.data)
            .await
            .map_err(|e| JobError::Setup(format!("failed to stage input: {e}")))?;
        reporter.advance(10, "Input staged");

        let mut source = self
            .video
            .open_file(&input_path)
            .await
            .map_err(|e| JobError::InvalidInput(format!("Invalid video file: {e}")))?;
        let properties = source.properties();
        if properties.fps <= 0.0 || properties.width == 0 || properties.height == 0 {
            return Err(JobError::InvalidInput(format!(
                "Video reports unusable properties: {}x{} at {} fps",
                properties.width, properties.height, properties.fps
            )));
        }
        tracing::info!(
            job_id = %request.job_id,
            width = properties.width,
            height = properties.height,
            fps = properties.fps,
            total_frames = properties.total_frames,
            "Video opened"
        );
        reporter.advance(
            20,
            format!(
                "Video opened: {}x{} at {:.2} fps",
                properties.width, properties.height, properties.fps
            ),
        );

        let output_path = scratch.path().join(names.output("mp4"));
        let (mut sink, codec) = self.open_sink(&output_path, &properties).await?;
        reporter.advance(40, format!("Encoder ready ({codec})"));

        let budget = frame_budget(max_frames, properties.total_frames);
        let mut frames: Vec<FrameResult> = Vec::new();
        let mut processed: u64 = 0;
        reporter.advance(60, "Processing frames");

        while processed < budget {
            reporter.checkpoint()?;
            let frame = match source.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        job_id = %request.job_id,
                        frame = processed,
                        error = %e,
                        "Frame decode failed, ending video early"
                    );
                    break;
                }
            };

            let (detections, annotated) = self.detect_frame(&frame, &request.config).await?;
            let annotated = fit_frame(annotated, properties.width, properties.height);
            sink.write_frame(&annotated).await?;

            frames.push(FrameResult::at(processed, properties.fps, detections));
            processed += 1;
            metrics::counter!("video_frames_processed_total").increment(1);

            reporter.advance_with(
                frame_progress(processed, budget),
                format!("Processed frame {processed}/{budget}"),
                |record| record.processed_frames = Some(processed),
            );
        }
        drop(source);

        sink.finish().await?;
        let written = tokio::fs::metadata(&output_path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        if written == 0 {
            return Err(JobError::Media(VideoError::Encoder(
                "annotated video is empty".to_string(),
            )));
        }

        let bytes = tokio::fs::read(&output_path)
            .await
            .map_err(|e| JobError::Setup(format!("failed to read annotated video: {e}")))?;
        reporter.checkpoint()?;
        let output = self
            .store
            .put(&names.output("mp4"), ArtifactKind::AnnotatedOutput, &bytes, "video/mp4")
            .await?;
        reporter.advance(95, "Annotated video stored");

        if let Err(e) = scratch.close() {
            tracing::warn!(job_id = %request.job_id, error = %e, "Failed to remove scratch directory");
        }

        Ok(VideoJobResult {
            success: true,
            file_id: names.file_id().to_string(),
            video_info: VideoInfo {
                width: properties.width,
                height: properties.height,
                fps: properties.fps,
                total_frames: properties.total_frames,
                processed_frames: processed,
                duration: properties.total_frames as f64 / properties.fps,
                filename: request.file.filename.clone(),
                codec: codec.to_string(),
            },
            total_detections: count_frame_detections(&frames),
            class_counts: class_counts(&frames),
            detections: frames,
            output_video_url: output.url,
            parameters: Parameters::new(&request.config, Some(max_frames)),
            timestamp: Utc::now(),
        })
    }

    /// Open a sink with the preferred codec, falling back in order of preference.
    async fn open_sink(
        &self,
        path: &Path,
        properties: &VideoProperties,
    ) -> Result<(Box<dyn FrameSink>, VideoCodec), JobError> {
        let mut last_error = None;
        for codec in VideoCodec::PREFERENCE {
            match self.video.create_sink(path, codec, properties).await {
                Ok(sink) => return Ok((sink, codec)),
                Err(e) => {
                    tracing::warn!(codec = %codec, error = %e, "Video codec unavailable, trying next");
                    last_error = Some(e);
                }
            }
        }
        Err(JobError::Media(last_error.unwrap_or_else(|| {
            VideoError::Encoder("no video codec configured".to_string())
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_budget() {
        assert_eq!(frame_budget(30, 50), 30);
        assert_eq!(frame_budget(30, 3), 3);
        assert_eq!(frame_budget(30, 0), 30);
    }

    #[test]
    fn test_frame_progress_band() {
        assert_eq!(frame_progress(0, 30), 60);
        assert_eq!(frame_progress(15, 30), 75);
        assert_eq!(frame_progress(30, 30), 90);
        assert_eq!(frame_progress(5, 0), 90);
    }
}
