#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use access_sentry::face::{Embedding, FaceAnalysis};
use access_sentry::orchestrator::{Models, PipelineBackend};
use access_sentry::plate_detection::{
    BoundingBox, CaptureDevice, Detection, ObjectDetection, TextFragment, TextRecognition,
};
use anyhow::{anyhow, Result};
use opencv::core::{Scalar, CV_8UC3};
use opencv::prelude::*;

pub fn frame() -> Mat {
    Mat::new_rows_cols_with_default(480, 640, CV_8UC3, Scalar::all(60.0)).unwrap()
}

#[derive(Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Finds the same faces in every image it is shown.
pub struct FixedFaces {
    pub boxes: Vec<BoundingBox>,
    pub embeddings: Vec<Embedding>,
    pub calls: Calls,
}

impl FaceAnalysis for FixedFaces {
    fn locate_faces(&mut self, _image: &Mat) -> Result<Vec<BoundingBox>> {
        self.calls.hit();
        Ok(self.boxes.clone())
    }

    fn embed(&mut self, _image: &Mat, boxes: &[BoundingBox]) -> Result<Vec<Embedding>> {
        Ok(self.embeddings.iter().take(boxes.len()).cloned().collect())
    }
}

pub struct FixedDetector {
    pub detections: Vec<Detection>,
    pub calls: Calls,
}

impl ObjectDetection for FixedDetector {
    fn infer(&mut self, _image: &Mat) -> Result<Vec<Detection>> {
        self.calls.hit();
        Ok(self.detections.clone())
    }
}

pub struct FixedOcr {
    pub fragments: Vec<TextFragment>,
    pub calls: Calls,
}

impl TextRecognition for FixedOcr {
    fn read(&mut self, _image: &Mat) -> Result<Vec<TextFragment>> {
        self.calls.hit();
        Ok(self.fragments.clone())
    }
}

/// Every call counter of one set of models.
#[derive(Clone, Default)]
pub struct ModelCalls {
    pub faces: Calls,
    pub objects: Calls,
    pub plates: Calls,
    pub ocr: Calls,
}

#[derive(Clone, Default)]
pub struct Scene {
    pub face_boxes: Vec<BoundingBox>,
    pub embeddings: Vec<Embedding>,
    pub objects: Vec<Detection>,
    pub plates: Vec<Detection>,
    pub text: Vec<TextFragment>,
}

impl Scene {
    pub fn models(&self, calls: &ModelCalls) -> Models {
        Models {
            faces: Box::new(FixedFaces {
                boxes: self.face_boxes.clone(),
                embeddings: self.embeddings.clone(),
                calls: calls.faces.clone(),
            }),
            objects: Box::new(FixedDetector {
                detections: self.objects.clone(),
                calls: calls.objects.clone(),
            }),
            plate_detector: Box::new(FixedDetector {
                detections: self.plates.clone(),
                calls: calls.plates.clone(),
            }),
            ocr: Box::new(FixedOcr {
                fragments: self.text.clone(),
                calls: calls.ocr.clone(),
            }),
        }
    }
}

/// Serves `frames` frames, or forever when `None`, then reports end of
/// stream.
pub struct ScriptedCamera {
    remaining: Option<usize>,
    released: Arc<AtomicBool>,
    pace: Duration,
}

impl CaptureDevice for ScriptedCamera {
    fn read(&mut self) -> Result<Option<Mat>> {
        std::thread::sleep(self.pace);
        match &mut self.remaining {
            Some(0) => Ok(None),
            Some(n) => {
                *n -= 1;
                Ok(Some(frame()))
            }
            None => Ok(Some(frame())),
        }
    }

    fn release(&mut self) -> Result<()> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockBackend {
    pub scene: Scene,
    pub calls: ModelCalls,
    pub frames: Option<usize>,
    pub fail_models: bool,
    pub fail_capture: bool,
    pub released: Arc<AtomicBool>,
    pub opened: Calls,
}

impl MockBackend {
    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl PipelineBackend for MockBackend {
    fn load_models(&self) -> Result<Models> {
        if self.fail_models {
            return Err(anyhow!("model file missing"));
        }
        Ok(self.scene.models(&self.calls))
    }

    fn open_capture(&self) -> Result<Box<dyn CaptureDevice>> {
        if self.fail_capture {
            return Err(anyhow!("could not open camera"));
        }
        self.opened.hit();
        self.released.store(false, Ordering::SeqCst);
        Ok(Box::new(ScriptedCamera {
            remaining: self.frames,
            released: self.released.clone(),
            pace: Duration::from_millis(5),
        }))
    }
}

/// Polls `condition` for up to two seconds.
pub fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
