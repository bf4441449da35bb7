//! Test fixtures: generated media bytes and scripted detections

#![allow(dead_code)]

use std::io::Cursor;

use image::{ImageFormat, Rgb, RgbImage};
use media_detect::models::detection::DetectionResult;

/// Marker the mock video backend refuses to open.
pub const NOT_A_VIDEO: &[u8] = b"this is not a video container";

/// A small gradient image encoded as `format`.
pub fn image_bytes(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, 128])
    });
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, format)
        .expect("encoding a fixture image");
    buffer.into_inner()
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    image_bytes(width, height, ImageFormat::Png)
}

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    image_bytes(width, height, ImageFormat::Jpeg)
}

/// Bytes that no image decoder accepts.
pub fn corrupt_image_bytes() -> Vec<u8> {
    b"\x89PNG\r\n\x1a\nthis stops being a png right here".to_vec()
}

/// Opaque upload the mock video backend treats as a playable video.
pub fn video_bytes() -> Vec<u8> {
    b"mock-video-container".to_vec()
}

pub fn detection(class_name: &str, confidence: f32, bbox: [f32; 4]) -> DetectionResult {
    DetectionResult {
        class_name: class_name.to_string(),
        confidence,
        bbox: bbox.into(),
    }
}

/// Detections for a 64x48 frame: one box past the right edge, one below threshold.
pub fn street_scene() -> Vec<DetectionResult> {
    vec![
        detection("person", 0.91, [4.0, 6.0, 20.0, 40.0]),
        detection("car", 0.84, [30.0, 10.0, 80.0, 30.0]),
        detection("traffic light", 0.77, [50.0, 2.0, 56.0, 14.0]),
        detection("dog", 0.20, [10.0, 10.0, 14.0, 14.0]),
    ]
}
