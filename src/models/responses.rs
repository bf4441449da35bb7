use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::detection::{DetectionConfig, DetectionResult, FrameResult};
use crate::models::job::JobKind;

/// Echo of the parameters a job ran with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub selected_classes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_frames: Option<u64>,
}

impl Parameters {
    pub fn new(config: &DetectionConfig, max_frames: Option<u64>) -> Self {
        Self {
            conf_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
            selected_classes: config.class_filter.clone(),
            max_frames,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub filename: String,
}

/// Outcome of a single-image job (also one entry of a batch).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageJobResult {
    pub success: bool,
    pub file_id: String,
    pub detections: Vec<DetectionResult>,
    pub total_detections: usize,
    pub image_info: ImageInfo,
    pub output_image_url: String,
    pub labels_txt_url: String,
    pub parameters: Parameters,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub total_frames: u64,
    pub processed_frames: u64,
    /// `total_frames / fps`, in seconds.
    pub duration: f64,
    pub filename: String,
    pub codec: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoJobResult {
    pub success: bool,
    pub file_id: String,
    pub video_info: VideoInfo,
    pub detections: Vec<FrameResult>,
    pub total_detections: usize,
    /// Detections per class across all processed frames.
    pub class_counts: BTreeMap<String, usize>,
    pub output_video_url: String,
    pub parameters: Parameters,
    pub timestamp: DateTime<Utc>,
}

/// A batch member that was skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub index: usize,
    pub filename: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJobResult {
    pub success: bool,
    pub batch_id: Uuid,
    pub total_files: usize,
    pub processed_files: usize,
    pub results: Vec<ImageJobResult>,
    pub skipped: Vec<SkippedFile>,
    pub total_detections: usize,
    pub parameters: Parameters,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamJobResult {
    pub success: bool,
    pub job_id: Uuid,
    pub stream_url: String,
    pub frames_processed: u64,
    pub detections_per_frame: Vec<FrameResult>,
    pub total_detections: usize,
    pub parameters: Parameters,
    pub timestamp: DateTime<Utc>,
}

/// Reply to an asynchronous submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub status: String,
    pub status_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub success: bool,
    pub file_id: Uuid,
    pub removed_files: Vec<String>,
    pub message: String,
}

/// Sum of detections across frames.
pub fn count_frame_detections(frames: &[FrameResult]) -> usize {
    frames.iter().map(|f| f.detections.len()).sum()
}

/// Per-class tally across frames.
pub fn class_counts(frames: &[FrameResult]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for detection in frames.iter().flat_map(|f| &f.detections) {
        *counts.entry(detection.class_name.clone()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class_name: &str) -> DetectionResult {
        DetectionResult {
            class_name: class_name.to_string(),
            confidence: 0.8,
            bbox: [0.0, 0.0, 1.0, 1.0].into(),
        }
    }

    #[test]
    fn test_class_counts() {
        let frames = vec![
            FrameResult::at(0, 10.0, vec![det("car"), det("person")]),
            FrameResult::at(1, 10.0, vec![det("car")]),
        ];
        let counts = class_counts(&frames);
        assert_eq!(counts["car"], 2);
        assert_eq!(counts["person"], 1);
        assert_eq!(count_frame_detections(&frames), 3);
    }

    #[test]
    fn test_parameters_echo() {
        let config = DetectionConfig {
            confidence_threshold: 0.3,
            iou_threshold: 0.6,
            class_filter: Some(vec!["dog".to_string()]),
        };
        let params = Parameters::new(&config, Some(30));
        assert_eq!(params.conf_threshold, 0.3);
        assert_eq!(params.max_frames, Some(30));
        let json = serde_json::to_value(Parameters::new(&config, None)).unwrap();
        assert!(json.get("max_frames").is_none());
    }
}
