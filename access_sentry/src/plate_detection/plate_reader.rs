use anyhow::Result;
use opencv::core::Size;
use opencv::imgproc::create_clahe;
use opencv::imgproc::cvt_color_def;
use opencv::imgproc::resize;
use opencv::imgproc::threshold;
use opencv::imgproc::COLOR_BGR2GRAY;
use opencv::imgproc::INTER_CUBIC;
use opencv::imgproc::THRESH_BINARY;
use opencv::imgproc::THRESH_OTSU;
use opencv::photo::fast_nl_means_denoising;
use opencv::prelude::*;
use tracing::{debug, warn};

use crate::metrics;

use super::{crop, BoundingBox, ObjectDetection, PlateCandidate, TextRecognition};

#[derive(Clone, Debug)]
pub struct PlateSettings {
    /// Plate regions below this confidence are discarded.
    pub plate_confidence: f32,
    /// Text fragments must be strictly above this probability.
    pub text_confidence: f32,
    pub upscale: f64,
}

impl Default for PlateSettings {
    fn default() -> Self {
        Self {
            plate_confidence: 0.4,
            text_confidence: 0.5,
            upscale: 2.0,
        }
    }
}

/// A plate that produced readable text.
#[derive(Debug)]
pub struct PlateRead {
    pub text: String,
    /// Relative to the vehicle crop the plate was found in.
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// The raw plate region, kept as evidence.
    pub image: Mat,
}

/// Keeps ASCII letters and digits, upper cased. `None` when nothing is left.
pub fn normalize_plate(text: &str) -> Option<String> {
    let normalized: String = text
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Enlarge, grey, local contrast, Otsu binarization and denoise.
pub fn prepare_for_ocr(plate: &Mat, upscale: f64) -> Result<Mat> {
    let mut enlarged = Mat::default();
    resize(
        plate,
        &mut enlarged,
        Size::default(),
        upscale,
        upscale,
        INTER_CUBIC,
    )?;

    let grey = if enlarged.channels() > 1 {
        let mut grey = Mat::default();
        cvt_color_def(&enlarged, &mut grey, COLOR_BGR2GRAY)?;
        grey
    } else {
        enlarged
    };

    let mut clahe = create_clahe(2.0, Size::new(8, 8))?;
    let mut equalized = Mat::default();
    clahe.apply(&grey, &mut equalized)?;

    let mut binary = Mat::default();
    threshold(
        &equalized,
        &mut binary,
        0.0,
        255.0,
        THRESH_BINARY | THRESH_OTSU,
    )?;

    let mut denoised = Mat::default();
    fast_nl_means_denoising(&binary, &mut denoised, 10.0, 7, 21)?;
    Ok(denoised)
}

/// Plate localisation and reading inside a single vehicle crop.
pub struct PlateReader {
    detector: Box<dyn ObjectDetection>,
    ocr: Box<dyn TextRecognition>,
    settings: PlateSettings,
}

impl PlateReader {
    pub fn new(
        detector: Box<dyn ObjectDetection>,
        ocr: Box<dyn TextRecognition>,
        settings: PlateSettings,
    ) -> Self {
        Self {
            detector,
            ocr,
            settings,
        }
    }

    /// Plate regions over the threshold, best first. Text is not read yet.
    pub fn locate(&mut self, vehicle: &Mat) -> Result<Vec<PlateCandidate>> {
        if vehicle.empty() || vehicle.cols() == 0 || vehicle.rows() == 0 {
            return Ok(vec![]);
        }
        let mut candidates: Vec<PlateCandidate> = self
            .detector
            .infer(vehicle)?
            .into_iter()
            .filter(|d| d.confidence >= self.settings.plate_confidence)
            .map(|d| PlateCandidate {
                bbox: d.bbox.clamp(vehicle.cols(), vehicle.rows()),
                confidence: d.confidence,
                text: None,
            })
            .collect();
        candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(candidates)
    }

    /// Recognized and normalized text of a plate image.
    pub fn read_text(&mut self, plate: &Mat) -> Result<Option<String>> {
        if plate.empty() || plate.cols() == 0 || plate.rows() == 0 {
            return Ok(None);
        }
        let prepared = prepare_for_ocr(plate, self.settings.upscale)?;
        let raw: String = self
            .ocr
            .read(&prepared)?
            .into_iter()
            .filter(|fragment| fragment.confidence > self.settings.text_confidence)
            .map(|fragment| fragment.text)
            .collect();
        Ok(normalize_plate(&raw))
    }

    /// Best readable plate in the crop, or `None` when no candidate yields
    /// text.
    pub fn locate_and_read(&mut self, vehicle: &Mat) -> Result<Option<PlateRead>> {
        for mut candidate in self.locate(vehicle)? {
            let Some(plate) = crop(vehicle, candidate.bbox)? else {
                continue;
            };
            candidate.text = match self.read_text(&plate) {
                Ok(text) => text,
                Err(e) => {
                    warn!(confidence = candidate.confidence, "plate candidate unreadable: {e:#}");
                    metrics::STAGE_FAILURES.with_label_values(&["ocr"]).inc();
                    continue;
                }
            };
            debug!(
                confidence = candidate.confidence,
                text = ?candidate.text,
                "plate candidate"
            );
            if let Some(text) = candidate.text {
                return Ok(Some(PlateRead {
                    text,
                    bbox: candidate.bbox,
                    confidence: candidate.confidence,
                    image: plate,
                }));
            }
        }
        Ok(None)
    }
}
