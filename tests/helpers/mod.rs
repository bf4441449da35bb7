//! Test helpers: scripted detector, in-memory video backend and HTTP utilities

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use reqwest::multipart;
use serde_json::Value;
use tempfile::TempDir;
use tokio::time::sleep;
use uuid::Uuid;

use media_detect::jobs::{DetectionEngine, JobLimits};
use media_detect::models::detection::{DetectionConfig, DetectionResult};
use media_detect::models::job::{JobState, StatusRecord};
use media_detect::services::detector::{
    DetectionCapability, DetectionError, DetectionOutput, DetectorProfile,
};
use media_detect::services::registry::StatusRegistry;
use media_detect::services::render;
use media_detect::services::storage::LocalArtifactStore;
use media_detect::services::video::{
    FrameSink, FrameSource, VideoBackend, VideoCodec, VideoError, VideoProperties,
};

use crate::fixtures::NOT_A_VIDEO;

/// Detector that returns the same scripted detections for every frame, applying the
/// threshold and allow-list the way a real detector does.
pub struct MockDetector {
    profile: DetectorProfile,
    detections: Vec<DetectionResult>,
    fail: bool,
    delay: Option<Duration>,
    /// Annotated frames come back at this size instead of the input's.
    annotated_size: Option<(u32, u32)>,
    calls: AtomicUsize,
}

impl MockDetector {
    pub fn returning(detections: Vec<DetectionResult>) -> Self {
        Self {
            profile: DetectorProfile::coco("mock-yolo.pt"),
            detections,
            fail: false,
            delay: None,
            annotated_size: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::returning(Vec::new())
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_annotated_size(mut self, width: u32, height: u32) -> Self {
        self.annotated_size = Some((width, height));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DetectionCapability for MockDetector {
    fn profile(&self) -> &DetectorProfile {
        &self.profile
    }

    async fn detect(
        &self,
        frame: &RgbImage,
        config: &DetectionConfig,
    ) -> Result<DetectionOutput, DetectionError> {
        if let Some(delay) = self.delay {
            sleep(delay).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DetectionError::Worker("scripted detector failure".to_string()));
        }
        let detections: Vec<DetectionResult> = self
            .detections
            .iter()
            .filter(|d| d.confidence >= config.confidence_threshold)
            .filter(|d| config.allows(&d.class_name))
            .cloned()
            .collect();
        let annotated = match self.annotated_size {
            Some((width, height)) => {
                let canvas = imageops::resize(frame, width, height, FilterType::Nearest);
                render::annotate(&canvas, &detections)
            }
            None => render::annotate(frame, &detections),
        };
        Ok(DetectionOutput {
            detections,
            annotated,
        })
    }
}

/// Video backend that synthesizes frames and writes a byte summary as the "video".
#[derive(Clone)]
pub struct MockVideoBackend {
    pub properties: VideoProperties,
    /// Frames the source actually yields; may be fewer than `total_frames`.
    pub frames_available: u64,
    pub unavailable_codecs: Vec<VideoCodec>,
    pub empty_output: bool,
    pub stream_online: bool,
    pub attempted_codecs: Arc<Mutex<Vec<VideoCodec>>>,
}

impl MockVideoBackend {
    pub fn new(width: u32, height: u32, fps: f64, total_frames: u64) -> Self {
        Self {
            properties: VideoProperties {
                fps,
                width,
                height,
                total_frames,
            },
            frames_available: total_frames,
            unavailable_codecs: Vec::new(),
            empty_output: false,
            stream_online: true,
            attempted_codecs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn attempted(&self) -> Vec<VideoCodec> {
        self.attempted_codecs.lock().unwrap().clone()
    }

    fn source(&self) -> Box<dyn FrameSource> {
        Box::new(MockSource {
            properties: self.properties,
            remaining: self.frames_available,
            shade: 0,
        })
    }
}

struct MockSource {
    properties: VideoProperties,
    remaining: u64,
    shade: u8,
}

#[async_trait]
impl FrameSource for MockSource {
    fn properties(&self) -> VideoProperties {
        self.properties
    }

    async fn read_frame(&mut self) -> Result<Option<RgbImage>, VideoError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        self.shade = self.shade.wrapping_add(16);
        Ok(Some(RgbImage::from_pixel(
            self.properties.width,
            self.properties.height,
            Rgb([self.shade, 64, 64]),
        )))
    }
}

struct MockSink {
    path: std::path::PathBuf,
    size: (u32, u32),
    frames: u64,
    empty_output: bool,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn write_frame(&mut self, frame: &RgbImage) -> Result<(), VideoError> {
        if frame.dimensions() != self.size {
            return Err(VideoError::FrameSize {
                expected: self.size,
                actual: frame.dimensions(),
            });
        }
        self.frames += 1;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<(), VideoError> {
        let contents = if self.empty_output {
            Vec::new()
        } else {
            format!("MOCKMP4 frames={}", self.frames).into_bytes()
        };
        tokio::fs::write(&self.path, contents).await?;
        Ok(())
    }
}

#[async_trait]
impl VideoBackend for MockVideoBackend {
    async fn open_file(&self, path: &Path) -> Result<Box<dyn FrameSource>, VideoError> {
        let data = tokio::fs::read(path).await?;
        if data.starts_with(NOT_A_VIDEO) {
            return Err(VideoError::Probe("no video stream found".to_string()));
        }
        Ok(self.source())
    }

    async fn open_stream(&self, url: &str) -> Result<Box<dyn FrameSource>, VideoError> {
        if !self.stream_online {
            return Err(VideoError::Unavailable(format!("cannot connect to {url}")));
        }
        Ok(self.source())
    }

    async fn create_sink(
        &self,
        path: &Path,
        codec: VideoCodec,
        properties: &VideoProperties,
    ) -> Result<Box<dyn FrameSink>, VideoError> {
        self.attempted_codecs.lock().unwrap().push(codec);
        if self.unavailable_codecs.contains(&codec) {
            return Err(VideoError::CodecUnavailable(codec));
        }
        Ok(Box::new(MockSink {
            path: path.to_path_buf(),
            size: (properties.width, properties.height),
            frames: 0,
            empty_output: self.empty_output,
        }))
    }
}

/// An engine over a temporary local store.
pub struct TestEngine {
    pub engine: Arc<DetectionEngine>,
    pub detector: Arc<MockDetector>,
    pub video: MockVideoBackend,
    pub dir: TempDir,
}

pub async fn test_engine(detector: MockDetector, video: MockVideoBackend) -> TestEngine {
    test_engine_with_limits(detector, video, test_limits()).await
}

pub fn test_limits() -> JobLimits {
    JobLimits {
        job_timeout: Duration::from_secs(30),
        ..JobLimits::default()
    }
}

pub async fn test_engine_with_limits(
    detector: MockDetector,
    video: MockVideoBackend,
    limits: JobLimits,
) -> TestEngine {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalArtifactStore::new(dir.path().join("uploads"), dir.path().join("outputs"))
        .await
        .unwrap();
    let work_dir = dir.path().join("work");
    tokio::fs::create_dir_all(&work_dir).await.unwrap();

    let detector = Arc::new(detector);
    let registry = Arc::new(StatusRegistry::new(Duration::from_secs(60)));
    let engine = DetectionEngine::new(
        registry,
        Arc::new(store),
        detector.clone(),
        Arc::new(video.clone()),
        limits,
        work_dir,
    );
    TestEngine {
        engine: Arc::new(engine),
        detector,
        video,
        dir,
    }
}

/// Poll the registry until the job leaves `processing`.
pub async fn wait_for_terminal(engine: &DetectionEngine, job_id: Uuid) -> StatusRecord {
    for _ in 0..400 {
        if let Ok(record) = engine.status(job_id) {
            if record.status != JobState::Processing {
                return record;
            }
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("job {job_id} did not finish in time");
}

/// Hand-built `multipart/form-data` body for router tests.
pub struct MultipartBody {
    boundary: String,
    body: Vec<u8>,
}

impl MultipartBody {
    pub fn new() -> Self {
        Self {
            boundary: format!("----media-detect-{}", Uuid::new_v4().simple()),
            body: Vec::new(),
        }
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n",
                self.boundary
            )
            .as_bytes(),
        );
        self
    }

    pub fn file(mut self, name: &str, filename: &str, content_type: &str, data: &[u8]) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n",
                self.boundary
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(data);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    /// `(content-type header, body)`
    pub fn finish(mut self) -> (String, Vec<u8>) {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        (
            format!("multipart/form-data; boundary={}", self.boundary),
            self.body,
        )
    }
}

/// Upload an image to a running server and return the JSON reply.
pub async fn upload_image(
    client: &reqwest::Client,
    base_url: &str,
    image_bytes: Vec<u8>,
    filename: &str,
    extra: &[(&str, &str)],
) -> Result<(reqwest::StatusCode, Value), Box<dyn std::error::Error>> {
    let mut form = multipart::Form::new().part(
        "file",
        multipart::Part::bytes(image_bytes)
            .file_name(filename.to_string())
            .mime_str("image/png")?,
    );
    for (name, value) in extra {
        form = form.text(name.to_string(), value.to_string());
    }

    let response = client
        .post(format!("{}/predict", base_url))
        .multipart(form)
        .send()
        .await?;
    let status = response.status();
    let body = response.json::<Value>().await?;
    Ok((status, body))
}

/// Poll `/status/{id}` on a running server until completed or error (with timeout).
pub async fn poll_job_status(
    client: &reqwest::Client,
    base_url: &str,
    job_id: &str,
    timeout_secs: u64,
) -> Result<Value, Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs * 2; // Poll every 500ms

    for attempt in 0..max_attempts {
        let response = client
            .get(format!("{}/status/{}", base_url, job_id))
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(format!("Status check failed: {}", error_text).into());
        }

        let status = response.json::<Value>().await?;
        match status["status"].as_str() {
            Some("completed") | Some("error") => return Ok(status),
            Some("processing") => {
                if attempt % 10 == 0 && attempt > 0 {
                    println!("  ... still waiting (attempt {}/{})", attempt, max_attempts);
                }
                sleep(Duration::from_millis(500)).await;
            }
            other => return Err(format!("Unknown job status: {:?}", other).into()),
        }
    }

    Err(format!("Job did not complete within {} seconds", timeout_secs).into())
}
