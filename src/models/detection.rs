use garde::Validate;
use serde::{Deserialize, Serialize};

/// Default confidence threshold applied when a request does not set one.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

/// Default IoU threshold for non-maximum suppression.
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

/// 80 COCO object classes, in model output order.
pub const COCO_CLASSES: &[&str] = &[
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat",
    "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack",
    "umbrella", "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball",
    "kite", "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket",
    "bottle", "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple",
    "sandwich", "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair",
    "couch", "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse",
    "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink",
    "refrigerator", "book", "clock", "vase", "scissors", "teddy bear", "hair drier",
    "toothbrush",
];

/// Per-call detection parameters.
///
/// Passed explicitly into every detector invocation, so concurrent jobs with different
/// thresholds never observe each other's settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct DetectionConfig {
    #[garde(custom(unit_interval))]
    pub confidence_threshold: f32,

    #[garde(custom(unit_interval))]
    pub iou_threshold: f32,

    /// Class names to keep. `None` keeps every class.
    #[garde(skip)]
    pub class_filter: Option<Vec<String>>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            class_filter: None,
        }
    }
}

impl DetectionConfig {
    /// Whether a class name passes the allow-list (exact, case-sensitive).
    pub fn allows(&self, class_name: &str) -> bool {
        match &self.class_filter {
            Some(classes) => classes.iter().any(|c| c == class_name),
            None => true,
        }
    }
}

fn unit_interval(value: &f32, _ctx: &()) -> garde::Result {
    if *value > 0.0 && *value <= 1.0 {
        Ok(())
    } else {
        Err(garde::Error::new(format!(
            "threshold must be in (0, 1], got {value}"
        )))
    }
}

/// Axis-aligned box in pixel coordinates: `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl From<[f32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [f32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Clamp to `[0, width] x [0, height]`. Returns `None` when nothing of the box
    /// remains inside the frame.
    pub fn clamped(&self, width: u32, height: u32) -> Option<Self> {
        let (w, h) = (width as f32, height as f32);
        let clamped = Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        };
        (clamped.x1 < clamped.x2 && clamped.y1 < clamped.y2).then_some(clamped)
    }

    pub fn within(&self, width: u32, height: u32) -> bool {
        self.x1 >= 0.0
            && self.y1 >= 0.0
            && self.x2 <= width as f32
            && self.y2 <= height as f32
            && self.x1 < self.x2
            && self.y1 < self.y2
    }
}

/// One object found by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl DetectionResult {
    /// Label-file line: `class x1 y1 x2 y2 confidence`.
    ///
    /// Class names may contain spaces ("traffic light"), so readers should take the last
    /// five fields from the right.
    pub fn label_line(&self) -> String {
        let b = &self.bbox;
        format!(
            "{} {:.2} {:.2} {:.2} {:.2} {:.4}",
            self.class_name, b.x1, b.y1, b.x2, b.y2, self.confidence
        )
    }
}

/// Detections for one decoded video or stream frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameResult {
    #[serde(rename = "frame")]
    pub frame_index: u64,
    #[serde(rename = "timestamp")]
    pub timestamp_seconds: f64,
    pub detections: Vec<DetectionResult>,
}

impl FrameResult {
    /// Build a frame result; sources without a frame rate report timestamp 0.
    pub fn at(frame_index: u64, fps: f64, detections: Vec<DetectionResult>) -> Self {
        let timestamp_seconds = if fps > 0.0 {
            frame_index as f64 / fps
        } else {
            0.0
        };
        Self {
            frame_index,
            timestamp_seconds,
            detections,
        }
    }
}

/// Keep detections whose class passes the allow-list.
pub fn filter_by_classes(
    detections: Vec<DetectionResult>,
    config: &DetectionConfig,
) -> Vec<DetectionResult> {
    detections
        .into_iter()
        .filter(|d| config.allows(&d.class_name))
        .collect()
}
