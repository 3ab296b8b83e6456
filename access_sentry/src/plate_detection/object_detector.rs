use anyhow::{anyhow, Result};
use opencv::core::Rect;
use opencv::core::Scalar;
use opencv::core::Size;
use opencv::core::Vector;
use opencv::core::CV_32F;
use opencv::dnn;
use opencv::dnn::blob_from_image;
use opencv::dnn::nms_boxes;
use opencv::dnn::Net;
use opencv::dnn::DNN_BACKEND_CUDA;
use opencv::dnn::DNN_BACKEND_OPENCV;
use opencv::dnn::DNN_TARGET_CPU;
use opencv::dnn::DNN_TARGET_CUDA;
use opencv::prelude::Mat;
use opencv::prelude::MatTraitConst;
use opencv::prelude::MatTraitConstManual;
use opencv::prelude::NetTrait;
use opencv::prelude::NetTraitConst;
use serde::Deserialize;
use tracing::debug;

use super::{BoundingBox, Detection, ObjectDetection};

/// Class table of the COCO trained general purpose models.
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich",
    "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote",
    "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book",
    "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

pub const PLATE_CLASSES: [&str; 1] = ["license_plate"];

const NMS_THRESHOLD: f32 = 0.45;

/// Output layout of the exported network.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum YoloFormat {
    /// `[1, candidates, 5 + classes]` rows with an objectness column.
    V5,
    /// `[1, 4 + classes, candidates]`, no objectness.
    #[default]
    V8,
}

/// Raw network candidate before suppression.
#[derive(Clone, Copy, Debug)]
struct Candidate {
    rect: Rect,
    class_id: usize,
    score: f32,
}

trait YoloProcessor {
    fn candidates(&self, values: &[f32], classes: usize, score_floor: f32) -> Vec<Candidate>;
}

fn scaled_rect(cx: f32, cy: f32, w: f32, h: f32, x_factor: f32, y_factor: f32) -> Rect {
    let left = (cx - 0.5 * w) * x_factor;
    let top = (cy - 0.5 * h) * y_factor;
    Rect::new(
        left as i32,
        top as i32,
        (w * x_factor) as i32,
        (h * y_factor) as i32,
    )
}

fn best_class(scores: impl Iterator<Item = f32>) -> Option<(usize, f32)> {
    scores
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

struct YoloProcessorV5 {
    x_factor: f32,
    y_factor: f32,
}

impl YoloProcessor for YoloProcessorV5 {
    fn candidates(&self, values: &[f32], classes: usize, score_floor: f32) -> Vec<Candidate> {
        let stride = 5 + classes;
        let mut out = vec![];
        for row in values.chunks_exact(stride) {
            let objectness = row[4];
            if objectness < score_floor {
                continue;
            }
            let Some((class_id, class_score)) = best_class(row[5..].iter().copied()) else {
                continue;
            };
            let score = objectness * class_score;
            if score < score_floor {
                continue;
            }
            out.push(Candidate {
                rect: scaled_rect(row[0], row[1], row[2], row[3], self.x_factor, self.y_factor),
                class_id,
                score,
            });
        }
        out
    }
}

struct YoloProcessorV8 {
    x_factor: f32,
    y_factor: f32,
}

impl YoloProcessor for YoloProcessorV8 {
    fn candidates(&self, values: &[f32], classes: usize, score_floor: f32) -> Vec<Candidate> {
        let rows = 4 + classes;
        if values.len() % rows != 0 {
            return vec![];
        }
        // Channel major: value (c, i) lives at c * anchors + i.
        let anchors = values.len() / rows;
        let at = |c: usize, i: usize| values[c * anchors + i];
        let mut out = vec![];
        for i in 0..anchors {
            let Some((class_id, score)) = best_class((0..classes).map(|c| at(4 + c, i))) else {
                continue;
            };
            if score < score_floor {
                continue;
            }
            out.push(Candidate {
                rect: scaled_rect(
                    at(0, i),
                    at(1, i),
                    at(2, i),
                    at(3, i),
                    self.x_factor,
                    self.y_factor,
                ),
                class_id,
                score,
            });
        }
        out
    }
}

/// Class aware non maximum suppression.
fn suppress(candidates: Vec<Candidate>, score_floor: f32) -> Result<Vec<Candidate>> {
    let mut kept = vec![];
    let mut class_ids: Vec<usize> = candidates.iter().map(|c| c.class_id).collect();
    class_ids.sort_unstable();
    class_ids.dedup();

    for class_id in class_ids {
        let group: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.class_id == class_id)
            .collect();
        let boxes: Vector<Rect> = group.iter().map(|c| c.rect).collect();
        let scores: Vector<f32> = group.iter().map(|c| c.score).collect();
        let mut indices = Vector::<i32>::default();
        nms_boxes(&boxes, &scores, score_floor, NMS_THRESHOLD, &mut indices, 1.0, 0)?;
        for i in indices {
            kept.push(*group[i as usize]);
        }
    }
    kept.sort_by(|a, b| b.score.total_cmp(&a.score));
    Ok(kept)
}

pub struct ObjectDetector {
    classifier: Net,
    input_size: i32,
    format: YoloFormat,
    class_names: Vec<String>,
    /// Candidate floor of the model itself, class specific thresholds are
    /// applied by the callers.
    score_floor: f32,
}

impl ObjectDetector {
    pub fn general(model_path: &str, format: YoloFormat, use_gpu: bool) -> Result<Self> {
        Self::from_onnx(model_path, format, use_gpu, &COCO_CLASSES)
    }

    pub fn plate_detector(model_path: &str, format: YoloFormat, use_gpu: bool) -> Result<Self> {
        Self::from_onnx(model_path, format, use_gpu, &PLATE_CLASSES)
    }

    fn from_onnx(
        model_path: &str,
        format: YoloFormat,
        use_gpu: bool,
        class_names: &[&str],
    ) -> Result<Self> {
        let mut classifier = dnn::read_net_from_onnx(model_path)
            .map_err(|e| anyhow!("cannot load detector {model_path}: {e}"))?;

        if use_gpu {
            classifier.set_preferable_backend(DNN_BACKEND_CUDA)?;
            classifier.set_preferable_target(DNN_TARGET_CUDA)?;
        } else {
            classifier.set_preferable_backend(DNN_BACKEND_OPENCV)?;
            classifier.set_preferable_target(DNN_TARGET_CPU)?;
        }

        Ok(ObjectDetector {
            classifier,
            input_size: 640,
            format,
            class_names: class_names.iter().map(|name| name.to_string()).collect(),
            score_floor: 0.25,
        })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn post_processor(&self, img_rows: i32, img_cols: i32) -> Box<dyn YoloProcessor> {
        let x_factor = img_cols as f32 / self.input_size as f32;
        let y_factor = img_rows as f32 / self.input_size as f32;
        match self.format {
            YoloFormat::V5 => Box::new(YoloProcessorV5 { x_factor, y_factor }),
            YoloFormat::V8 => Box::new(YoloProcessorV8 { x_factor, y_factor }),
        }
    }
}

impl ObjectDetection for ObjectDetector {
    fn infer(&mut self, image: &Mat) -> Result<Vec<Detection>> {
        if image.empty() {
            return Ok(vec![]);
        }

        let blob = blob_from_image(
            image,
            1.0 / 255.0,
            Size::new(self.input_size, self.input_size),
            Scalar::default(),
            true,
            false,
            CV_32F,
        )?;

        self.classifier
            .set_input(&blob, "", 1.0, Scalar::default())?;

        let output_names = self.classifier.get_unconnected_out_layers_names()?;
        let mut output_values = Vector::<Mat>::default();
        self.classifier.forward(&mut output_values, &output_names)?;

        let processor = self.post_processor(image.rows(), image.cols());
        let mut candidates = vec![];
        for data in output_values.iter() {
            let values = data.data_typed::<f32>()?;
            candidates.extend(processor.candidates(
                values,
                self.class_names.len(),
                self.score_floor,
            ));
        }

        let kept = suppress(candidates, self.score_floor)?;
        debug!(candidates = kept.len(), "object detection");

        Ok(kept
            .into_iter()
            .map(|c| {
                let label = self
                    .class_names
                    .get(c.class_id)
                    .cloned()
                    .unwrap_or_else(|| format!("class_{}", c.class_id));
                Detection::new(BoundingBox::from_rect(c.rect), label, c.score)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v8_picks_best_class_per_anchor() {
        // 2 classes, 2 anchors, channel major.
        let values = vec![
            320.0, 100.0, // cx
            320.0, 100.0, // cy
            64.0, 10.0, // w
            32.0, 10.0, // h
            0.9, 0.1, // class 0
            0.2, 0.05, // class 1
        ];
        let processor = YoloProcessorV8 {
            x_factor: 1.0,
            y_factor: 1.0,
        };
        let out = processor.candidates(&values, 2, 0.25);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_id, 0);
        assert_eq!(out[0].rect, Rect::new(288, 304, 64, 32));
    }

    #[test]
    fn v5_combines_objectness_and_class_score() {
        let values = vec![
            50.0, 50.0, 20.0, 20.0, 0.8, 0.1, 0.9, // kept, class 1 at 0.72
            50.0, 50.0, 20.0, 20.0, 0.3, 0.5, 0.5, // 0.15 below floor
        ];
        let processor = YoloProcessorV5 {
            x_factor: 2.0,
            y_factor: 2.0,
        };
        let out = processor.candidates(&values, 2, 0.25);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].class_id, 1);
        assert!((out[0].score - 0.72).abs() < 1e-6);
        assert_eq!(out[0].rect, Rect::new(80, 80, 40, 40));
    }
}
