use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::jobs::{validate_config, DetectionEngine, JobError, JobReporter};
use crate::models::detection::{DetectionConfig, FrameResult};
use crate::models::job::JobKind;
use crate::models::responses::{count_frame_detections, Parameters, StreamJobResult};

/// URL schemes accepted for live sources. Local paths and `file:` URLs are refused.
const STREAM_SCHEMES: &[&str] = &["rtsp", "rtsps", "rtmp", "rtmps", "http", "https", "srt", "udp"];

#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub job_id: Uuid,
    pub stream_url: String,
    pub config: DetectionConfig,
    pub max_frames: Option<u64>,
}

impl StreamRequest {
    pub fn new(
        stream_url: impl Into<String>,
        config: DetectionConfig,
        max_frames: Option<u64>,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            stream_url: stream_url.into(),
            config,
            max_frames,
        }
    }
}

fn validate_stream_url(url: &str) -> Result<(), JobError> {
    let url = url.trim();
    let scheme = url
        .split_once("://")
        .map(|(scheme, rest)| (scheme.to_ascii_lowercase(), rest))
        .filter(|(_, rest)| !rest.is_empty())
        .map(|(scheme, _)| scheme)
        .ok_or_else(|| JobError::InvalidInput(format!("Invalid stream URL: {url}")))?;
    if STREAM_SCHEMES.contains(&scheme.as_str()) {
        Ok(())
    } else {
        Err(JobError::InvalidInput(format!(
            "Unsupported stream scheme {scheme}, expected one of {}",
            STREAM_SCHEMES.join(", ")
        )))
    }
}

/// Progress for a stream: share of the frame budget, kept below 100 until done.
fn stream_progress(done: u64, max_frames: u64) -> u8 {
    if max_frames == 0 {
        return 99;
    }
    (done.min(max_frames) * 100 / max_frames).min(99) as u8
}

impl DetectionEngine {
    fn validate_stream(&self, request: &StreamRequest) -> Result<u64, JobError> {
        validate_config(&request.config)?;
        validate_stream_url(&request.stream_url)?;
        let max_frames = request.max_frames.unwrap_or(self.limits.default_stream_frames);
        if max_frames == 0 || max_frames > self.limits.max_frames_limit {
            return Err(JobError::InvalidInput(format!(
                "max_frames must be between 1 and {}",
                self.limits.max_frames_limit
            )));
        }
        Ok(max_frames)
    }

    /// Sample up to `max_frames` frames from a live source. No artifacts are written.
    pub async fn run_stream(&self, request: StreamRequest) -> Result<StreamJobResult, JobError> {
        let max_frames = self.validate_stream(&request)?;
        let reporter = JobReporter::start(self.registry.clone(), request.job_id, JobKind::Stream);
        self.execute_stream(&reporter, request, max_frames).await
    }

    pub fn submit_stream(self: &Arc<Self>, request: StreamRequest) -> Result<Uuid, JobError> {
        let max_frames = self.validate_stream(&request)?;
        let job_id = request.job_id;
        let reporter = JobReporter::start(self.registry.clone(), job_id, JobKind::Stream);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let _ = engine.execute_stream(&reporter, request, max_frames).await;
        });
        Ok(job_id)
    }

    async fn execute_stream(
        &self,
        reporter: &JobReporter,
        request: StreamRequest,
        max_frames: u64,
    ) -> Result<StreamJobResult, JobError> {
        self.drive(reporter, async {
            let mut source = self
                .video
                .open_stream(request.stream_url.trim())
                .await
                .map_err(|e| JobError::StreamUnavailable(e.to_string()))?;
            let fps = source.properties().fps;
            reporter.advance(1, "Stream opened");

            let mut frames: Vec<FrameResult> = Vec::new();
            let mut index: u64 = 0;
            while index < max_frames {
                reporter.checkpoint()?;
                let frame = match source.read_frame().await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(
                            job_id = %request.job_id,
                            frame = index,
                            error = %e,
                            "Stream read failed, ending early"
                        );
                        break;
                    }
                };

                let (detections, _) = self.detect_frame(&frame, &request.config).await?;
                frames.push(FrameResult::at(index, fps, detections));
                index += 1;

                reporter.advance_with(
                    stream_progress(index, max_frames),
                    format!("Processed frame {index}/{max_frames}"),
                    |record| record.processed_frames = Some(index),
                );
            }
            drop(source);

            let result = StreamJobResult {
                success: true,
                job_id: request.job_id,
                stream_url: request.stream_url.clone(),
                frames_processed: index,
                total_detections: count_frame_detections(&frames),
                detections_per_frame: frames,
                parameters: Parameters::new(&request.config, Some(max_frames)),
                timestamp: Utc::now(),
            };
            let message = format!(
                "Processed {} stream frames, {} detections",
                index, result.total_detections
            );
            reporter.complete(message, serde_json::to_value(&result)?, |record| {
                record.processed_frames = Some(index);
            });
            Ok(result)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_url_schemes() {
        assert!(validate_stream_url("rtsp://camera.local:554/live").is_ok());
        assert!(validate_stream_url("HTTPS://example.com/stream.m3u8").is_ok());
        assert!(validate_stream_url("file:///etc/passwd").is_err());
        assert!(validate_stream_url("/tmp/video.mp4").is_err());
        assert!(validate_stream_url("rtsp://").is_err());
    }

    #[test]
    fn test_stream_progress_stays_below_completion() {
        assert_eq!(stream_progress(0, 10), 0);
        assert_eq!(stream_progress(5, 10), 50);
        assert_eq!(stream_progress(10, 10), 99);
    }
}
