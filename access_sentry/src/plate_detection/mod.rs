pub mod bounding_box_render;
pub mod dnn_ocr;
pub mod object_detector;
pub mod plate_reader;
#[cfg(feature = "rtp-sink")]
pub mod rtp_sink;
pub mod video_reader;

use anyhow::Result;
use opencv::core::Rect;
use opencv::prelude::Mat;
use opencv::prelude::MatTraitConst;
use serde::Serialize;

/// Classes whose detections are handed to the plate pipeline.
pub const VEHICLE_CLASSES: [&str; 4] = ["car", "motorcycle", "truck", "bus"];

pub fn is_vehicle(label: &str) -> bool {
    VEHICLE_CLASSES.contains(&label)
}

/// Axis aligned box in pixel coordinates, corners are (x1, y1) inclusive and
/// (x2, y2) exclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_rect(rect: Rect) -> Self {
        Self::new(rect.x, rect.y, rect.x + rect.width, rect.y + rect.height)
    }

    pub fn width(&self) -> i32 {
        (self.x2 - self.x1).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.y2 - self.y1).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }

    pub fn is_empty(&self) -> bool {
        self.area() == 0
    }

    pub fn to_rect(&self) -> Rect {
        Rect::new(self.x1, self.y1, self.width(), self.height())
    }

    /// Shift the box by the origin of the crop it was found in.
    pub fn translate(&self, dx: i32, dy: i32) -> Self {
        Self::new(self.x1 + dx, self.y1 + dy, self.x2 + dx, self.y2 + dy)
    }

    pub fn scale(&self, factor: f64) -> Self {
        Self::new(
            (self.x1 as f64 * factor).round() as i32,
            (self.y1 as f64 * factor).round() as i32,
            (self.x2 as f64 * factor).round() as i32,
            (self.y2 as f64 * factor).round() as i32,
        )
    }

    /// Intersect with an image of `cols` x `rows`.
    pub fn clamp(&self, cols: i32, rows: i32) -> Self {
        Self::new(
            self.x1.clamp(0, cols),
            self.y1.clamp(0, rows),
            self.x2.clamp(0, cols),
            self.y2.clamp(0, rows),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub label: String,
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: BoundingBox, label: impl Into<String>, confidence: f32) -> Self {
        Self {
            bbox,
            label: label.into(),
            confidence,
        }
    }
}

/// A plate region found inside a vehicle crop.
#[derive(Clone, Debug, PartialEq)]
pub struct PlateCandidate {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub text: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TextFragment {
    pub text: String,
    pub confidence: f32,
}

impl TextFragment {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// Owned copy of the `bbox` region of `image`, `None` when the box has no
/// area once clipped to the image.
pub fn crop(image: &Mat, bbox: BoundingBox) -> Result<Option<Mat>> {
    if image.empty() {
        return Ok(None);
    }
    let clipped = bbox.clamp(image.cols(), image.rows());
    if clipped.is_empty() {
        return Ok(None);
    }
    let region = Mat::roi(image, clipped.to_rect())?;
    Ok(Some(region.try_clone()?))
}

/// Any box producing network, the general detector and the plate detector
/// share this shape.
pub trait ObjectDetection {
    fn infer(&mut self, image: &Mat) -> Result<Vec<Detection>>;
}

pub trait TextRecognition {
    fn read(&mut self, image: &Mat) -> Result<Vec<TextFragment>>;
}

/// Source of frames. `read` returns `None` once the stream is over or the
/// device stopped delivering data.
pub trait CaptureDevice {
    fn read(&mut self) -> Result<Option<Mat>>;
    fn release(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_can_collapse_to_empty() {
        let outside = BoundingBox::new(700, 10, 760, 50).clamp(640, 480);
        assert!(outside.is_empty());
        let inside = BoundingBox::new(-5, -5, 20, 30).clamp(640, 480);
        assert_eq!(inside, BoundingBox::new(0, 0, 20, 30));
    }

    #[test]
    fn translate_moves_crop_coordinates_into_frame() {
        let plate = BoundingBox::new(10, 20, 60, 40);
        assert_eq!(plate.translate(100, 200), BoundingBox::new(110, 220, 160, 240));
    }

    #[test]
    fn vehicle_classes() {
        assert!(is_vehicle("truck"));
        assert!(!is_vehicle("person"));
    }
}
