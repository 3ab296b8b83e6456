use anyhow::{anyhow, Result};
use opencv::core::Ptr;
use opencv::core::Size;
use opencv::dnn::DNN_BACKEND_OPENCV;
use opencv::dnn::DNN_TARGET_CPU;
use opencv::imgproc::resize;
use opencv::imgproc::INTER_LINEAR;
use opencv::objdetect::FaceDetectorYN;
use opencv::objdetect::FaceRecognizerSF;
use opencv::prelude::*;
use tracing::debug;

use super::{Embedding, FaceAnalysis};
use crate::plate_detection::{crop, BoundingBox};

const SCORE_THRESHOLD: f32 = 0.8;
const NMS_THRESHOLD: f32 = 0.3;
const TOP_K: i32 = 50;
/// Side of the square input expected by SFace.
const SFACE_INPUT: i32 = 112;
/// Largest distance between two L2 normalized embeddings.
pub const MAX_DISTANCE: f32 = 2.0;
/// OpenCV's published L2 match threshold for SFace. Use this as
/// `thresholds.face_tolerance` with this backend.
pub const MATCH_DISTANCE: f32 = 1.128;

/// YuNet localisation and SFace description through OpenCV's face API.
/// Embeddings are L2 normalized, so distances live in [0, 2].
pub struct SFaceAnalyzer {
    detector: Ptr<FaceDetectorYN>,
    recognizer: Ptr<FaceRecognizerSF>,
    /// Raw YuNet rows of the last `locate_faces` call, landmarks included,
    /// so `embed` can align the crops it is asked for.
    last_faces: Vec<(BoundingBox, Mat)>,
}

impl SFaceAnalyzer {
    pub fn new(detector_model: &str, recognizer_model: &str) -> Result<Self> {
        let detector = FaceDetectorYN::create(
            detector_model,
            "",
            Size::new(320, 320),
            SCORE_THRESHOLD,
            NMS_THRESHOLD,
            TOP_K,
            DNN_BACKEND_OPENCV,
            DNN_TARGET_CPU,
        )
        .map_err(|e| anyhow!("cannot load face detector {detector_model}: {e}"))?;
        let recognizer =
            FaceRecognizerSF::create(recognizer_model, "", DNN_BACKEND_OPENCV, DNN_TARGET_CPU)
                .map_err(|e| anyhow!("cannot load face recognizer {recognizer_model}: {e}"))?;
        Ok(Self {
            detector,
            recognizer,
            last_faces: vec![],
        })
    }

    fn aligned(&mut self, image: &Mat, bbox: BoundingBox) -> Result<Option<Mat>> {
        if let Some((_, row)) = self.last_faces.iter().find(|(b, _)| *b == bbox) {
            let mut aligned = Mat::default();
            self.recognizer.align_crop(image, row, &mut aligned)?;
            return Ok(Some(aligned));
        }
        // Unknown box: plain crop resized to the network input.
        let Some(region) = crop(image, bbox)? else {
            return Ok(None);
        };
        let mut resized = Mat::default();
        resize(
            &region,
            &mut resized,
            Size::new(SFACE_INPUT, SFACE_INPUT),
            0.0,
            0.0,
            INTER_LINEAR,
        )?;
        Ok(Some(resized))
    }
}

fn normalized(mut values: Vec<f32>) -> Embedding {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
    values
}

impl FaceAnalysis for SFaceAnalyzer {
    fn locate_faces(&mut self, image: &Mat) -> Result<Vec<BoundingBox>> {
        self.last_faces.clear();
        if image.empty() {
            return Ok(vec![]);
        }
        self.detector
            .set_input_size(Size::new(image.cols(), image.rows()))?;
        let mut faces = Mat::default();
        self.detector.detect(image, &mut faces)?;

        for i in 0..faces.rows() {
            let x = *faces.at_2d::<f32>(i, 0)?;
            let y = *faces.at_2d::<f32>(i, 1)?;
            let w = *faces.at_2d::<f32>(i, 2)?;
            let h = *faces.at_2d::<f32>(i, 3)?;
            let bbox = BoundingBox::new(x as i32, y as i32, (x + w) as i32, (y + h) as i32)
                .clamp(image.cols(), image.rows());
            if bbox.is_empty() {
                continue;
            }
            let row = faces.row(i)?.try_clone()?;
            self.last_faces.push((bbox, row));
        }
        debug!(faces = self.last_faces.len(), "face localisation");
        Ok(self.last_faces.iter().map(|(bbox, _)| *bbox).collect())
    }

    fn embed(&mut self, image: &Mat, boxes: &[BoundingBox]) -> Result<Vec<Embedding>> {
        let mut embeddings = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let Some(aligned) = self.aligned(image, *bbox)? else {
                return Err(anyhow!("face box {bbox:?} is outside the image"));
            };
            let mut feature = Mat::default();
            self.recognizer.feature(&aligned, &mut feature)?;
            embeddings.push(normalized(feature.data_typed::<f32>()?.to_vec()));
        }
        Ok(embeddings)
    }
}
