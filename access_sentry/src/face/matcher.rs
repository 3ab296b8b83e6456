use serde::Serialize;

use super::Embedding;

pub const UNKNOWN: &str = "Unknown";
pub const DEFAULT_TOLERANCE: f32 = 0.6;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FaceMatch {
    /// Registered name, or `UNKNOWN`.
    pub name: String,
    /// `1 - distance` of the closest known face, reported for unknown faces
    /// as well. `None` only when there was nothing to compare against.
    pub confidence: Option<f32>,
}

impl FaceMatch {
    pub fn unknown(confidence: Option<f32>) -> Self {
        Self {
            name: UNKNOWN.to_string(),
            confidence,
        }
    }

    pub fn is_known(&self) -> bool {
        self.name != UNKNOWN
    }
}

/// Euclidean distance, `None` for descriptors of different length.
pub fn face_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let squared: f32 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    Some(squared.sqrt())
}

/// Closest known face to `query`. A match needs a distance strictly below
/// `tolerance`.
pub fn match_face(
    query: &[f32],
    known: &[Embedding],
    names: &[String],
    tolerance: f32,
) -> FaceMatch {
    let best = known
        .iter()
        .zip(names)
        .filter_map(|(embedding, name)| Some((face_distance(query, embedding)?, name)))
        .min_by(|a, b| a.0.total_cmp(&b.0));

    match best {
        None => FaceMatch::unknown(None),
        Some((distance, name)) => {
            let confidence = Some(1.0 - distance);
            if distance < tolerance {
                FaceMatch {
                    name: name.clone(),
                    confidence,
                }
            } else {
                FaceMatch::unknown(confidence)
            }
        }
    }
}
