use std::io::Cursor;
use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use image::{ImageFormat, RgbImage};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::models::detection::{DetectionConfig, DetectionResult, COCO_CLASSES};
use crate::services::render;

/// A model plus the class names its output ids refer to.
///
/// Built once per model; jobs select a capability by reference instead of mutating
/// shared detector state.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorProfile {
    pub model_name: String,
    pub class_names: Vec<String>,
}

impl DetectorProfile {
    pub fn coco(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            class_names: COCO_CLASSES.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Load class names from a text file, one per line.
    pub async fn from_classes_file(model_name: &str, path: &Path) -> Result<Self, DetectionError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| DetectionError::ClassesFile {
                path: path.display().to_string(),
                source,
            })?;
        let class_names = parse_class_names(&contents);
        if class_names.is_empty() {
            return Err(DetectionError::EmptyClasses(path.display().to_string()));
        }
        Ok(Self {
            model_name: model_name.to_string(),
            class_names,
        })
    }

    /// Name for a model class id; unknown ids become `class_{id}`.
    pub fn class_name(&self, class_id: usize) -> String {
        self.class_names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }
}

fn parse_class_names(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// What one detector call produces for one frame.
#[derive(Debug, Clone)]
pub struct DetectionOutput {
    pub detections: Vec<DetectionResult>,
    /// Same dimensions as the input frame.
    pub annotated: RgbImage,
}

impl DetectionOutput {
    /// One label-file line per detection, in detection order.
    pub fn label_lines(&self) -> Vec<String> {
        self.detections.iter().map(DetectionResult::label_line).collect()
    }
}

/// Object detection over a decoded frame.
///
/// Implementations must be callable concurrently; every setting that affects a call
/// arrives through `config`.
#[async_trait]
pub trait DetectionCapability: Send + Sync {
    fn profile(&self) -> &DetectorProfile;

    async fn detect(
        &self,
        frame: &RgbImage,
        config: &DetectionConfig,
    ) -> Result<DetectionOutput, DetectionError>;

    /// Reachability probe for health reporting.
    async fn health_check(&self) -> Result<(), DetectionError> {
        Ok(())
    }
}

/// Client for a YOLO inference server speaking a small JSON protocol.
pub struct HttpDetector {
    http: Client,
    base_url: String,
    profile: DetectorProfile,
}

#[derive(Serialize)]
struct DetectRequest<'a> {
    model: &'a str,
    image: String,
    width: u32,
    height: u32,
    conf_threshold: f32,
    iou_threshold: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    classes: Option<Vec<usize>>,
}

#[derive(Deserialize)]
struct DetectResponse {
    detections: Vec<RawDetection>,
}

#[derive(Deserialize)]
struct RawDetection {
    class_id: usize,
    confidence: f32,
    bbox: [f32; 4],
}

impl HttpDetector {
    pub fn new(base_url: &str, profile: DetectorProfile) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            profile,
        }
    }

    /// Model class ids matching the allow-list, so the server can skip the rest.
    fn class_ids(&self, config: &DetectionConfig) -> Option<Vec<usize>> {
        config.class_filter.as_ref().map(|names| {
            self.profile
                .class_names
                .iter()
                .enumerate()
                .filter(|(_, name)| names.contains(name))
                .map(|(id, _)| id)
                .collect()
        })
    }
}

#[async_trait]
impl DetectionCapability for HttpDetector {
    fn profile(&self) -> &DetectorProfile {
        &self.profile
    }

    async fn detect(
        &self,
        frame: &RgbImage,
        config: &DetectionConfig,
    ) -> Result<DetectionOutput, DetectionError> {
        let owned = frame.clone();
        let png = tokio::task::spawn_blocking(move || encode_png(&owned))
            .await
            .map_err(|e| DetectionError::Worker(e.to_string()))??;

        let request = DetectRequest {
            model: &self.profile.model_name,
            image: base64::engine::general_purpose::STANDARD.encode(png),
            width: frame.width(),
            height: frame.height(),
            conf_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
            classes: self.class_ids(config),
        };

        let response = self
            .http
            .post(format!("{}/detect", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(DetectionError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DetectionError::Server {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: DetectResponse = response.json().await.map_err(DetectionError::Http)?;

        let detections: Vec<DetectionResult> = parsed
            .detections
            .into_iter()
            .filter(|raw| raw.confidence >= config.confidence_threshold)
            .map(|raw| DetectionResult {
                class_name: self.profile.class_name(raw.class_id),
                confidence: raw.confidence.clamp(0.0, 1.0),
                bbox: raw.bbox.into(),
            })
            .filter(|d| config.allows(&d.class_name))
            .collect();

        let annotated = render::annotate(frame, &detections);
        Ok(DetectionOutput {
            detections,
            annotated,
        })
    }

    async fn health_check(&self) -> Result<(), DetectionError> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(DetectionError::Http)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(DetectionError::Server {
                status: response.status().as_u16(),
                body: String::new(),
            })
        }
    }
}

fn encode_png(frame: &RgbImage) -> Result<Vec<u8>, DetectionError> {
    let mut buffer = Cursor::new(Vec::new());
    frame
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(DetectionError::Encode)?;
    Ok(buffer.into_inner())
}

#[derive(Debug, thiserror::Error)]
pub enum DetectionError {
    #[error("Detector request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Detector returned HTTP {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Failed to encode frame for the detector: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Detector worker failed: {0}")]
    Worker(String),

    #[error("Failed to read classes file {path}: {source}")]
    ClassesFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No classes found in {0}")]
    EmptyClasses(String),
}
