use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::face::sface::SFaceAnalyzer;
use crate::orchestrator::{Models, PipelineBackend};
use crate::plate_detection::dnn_ocr::DnnOcrReader;
use crate::plate_detection::object_detector::{ObjectDetector, YoloFormat};
use crate::plate_detection::video_reader::{CameraSettings, VideoReader};
use crate::plate_detection::CaptureDevice;

/// Model files on disk.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelSettings {
    pub face_detector: String,
    pub face_recognizer: String,
    pub object_detector: String,
    pub object_format: YoloFormat,
    pub plate_detector: String,
    pub plate_format: YoloFormat,
    /// Directory holding the tesseract language data.
    pub tessdata: String,
    pub ocr_language: String,
    pub use_gpu: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            face_detector: "models/face_detection_yunet_2023mar.onnx".to_string(),
            face_recognizer: "models/face_recognition_sface_2021dec.onnx".to_string(),
            object_detector: "models/yolov8n.onnx".to_string(),
            object_format: YoloFormat::V8,
            plate_detector: "models/license_plate_detector.onnx".to_string(),
            plate_format: YoloFormat::V8,
            tessdata: "/usr/share/tesseract-ocr/4.00/tessdata".to_string(),
            ocr_language: "eng".to_string(),
            use_gpu: false,
        }
    }
}

/// OpenCV DNN models, tesseract and a `VideoCapture` camera.
pub struct OpenCvBackend {
    models: ModelSettings,
    camera: CameraSettings,
}

impl OpenCvBackend {
    pub fn new(models: ModelSettings, camera: CameraSettings) -> Self {
        Self { models, camera }
    }
}

impl PipelineBackend for OpenCvBackend {
    fn load_models(&self) -> Result<Models> {
        let settings = &self.models;
        let faces = SFaceAnalyzer::new(&settings.face_detector, &settings.face_recognizer)
            .context("loading face models")?;
        let objects = ObjectDetector::general(
            &settings.object_detector,
            settings.object_format,
            settings.use_gpu,
        )
        .context("loading object detector")?;
        let plate_detector = ObjectDetector::plate_detector(
            &settings.plate_detector,
            settings.plate_format,
            settings.use_gpu,
        )
        .context("loading plate detector")?;
        let ocr = DnnOcrReader::new(&settings.tessdata, &settings.ocr_language)
            .context("loading ocr engine")?;
        info!(gpu = settings.use_gpu, "models loaded");

        Ok(Models {
            faces: Box::new(faces),
            objects: Box::new(objects),
            plate_detector: Box::new(plate_detector),
            ocr: Box::new(ocr),
        })
    }

    fn open_capture(&self) -> Result<Box<dyn CaptureDevice>> {
        Ok(Box::new(VideoReader::open(&self.camera)?))
    }
}
