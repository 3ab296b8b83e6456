pub mod matcher;
pub mod sface;

use anyhow::Result;
use opencv::prelude::Mat;

use crate::plate_detection::BoundingBox;

pub use matcher::{match_face, FaceMatch, DEFAULT_TOLERANCE, UNKNOWN};

/// Fixed length face descriptor.
pub type Embedding = Vec<f32>;

/// Face localisation and description, boxes are in `image` coordinates.
pub trait FaceAnalysis {
    fn locate_faces(&mut self, image: &Mat) -> Result<Vec<BoundingBox>>;
    /// One embedding per box, in the same order.
    fn embed(&mut self, image: &Mat, boxes: &[BoundingBox]) -> Result<Vec<Embedding>>;
}
