use image::{Rgb, RgbImage};

use crate::models::detection::DetectionResult;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;

/// Copy of `frame` with a box outline drawn around every detection.
pub fn annotate(frame: &RgbImage, detections: &[DetectionResult]) -> RgbImage {
    let mut annotated = frame.clone();
    for detection in detections {
        draw_box(&mut annotated, detection);
    }
    annotated
}

fn draw_box(image: &mut RgbImage, detection: &DetectionResult) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let Some(bbox) = detection.bbox.clamped(width, height) else {
        return;
    };
    let x1 = bbox.x1 as u32;
    let y1 = bbox.y1 as u32;
    let x2 = (bbox.x2 as u32).min(width - 1);
    let y2 = (bbox.y2 as u32).min(height - 1);

    for t in 0..BOX_THICKNESS {
        for x in x1..=x2 {
            put(image, x, y1.saturating_add(t));
            put(image, x, y2.saturating_sub(t));
        }
        for y in y1..=y2 {
            put(image, x1.saturating_add(t), y);
            put(image, x2.saturating_sub(t), y);
        }
    }
}

fn put(image: &mut RgbImage, x: u32, y: u32) {
    if x < image.width() && y < image.height() {
        image.put_pixel(x, y, BOX_COLOR);
    }
}
