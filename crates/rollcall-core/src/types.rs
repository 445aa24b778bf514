use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dimensionality of every face embedding in the gallery and from the encoder.
pub const EMBEDDING_DIM: usize = 128;

/// Identifier of an enrolled person, as assigned by the gallery store.
pub type IdentityId = i64;

/// Bounding box for a detected face, in pixel coordinates of the frame it was
/// detected in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Map the box into a frame `factor` times larger (inverse of a downsample).
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            confidence: self.confidence,
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidEmbedding {
    #[error("expected {expected}-dim embedding, got {actual}")]
    WrongDimension { expected: usize, actual: usize },
    #[error("non-finite value at index {index}")]
    NonFinite { index: usize },
}

/// A validated face embedding: exactly [`EMBEDDING_DIM`] finite values.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Result<Self, InvalidEmbedding> {
        if values.len() != EMBEDDING_DIM {
            return Err(InvalidEmbedding::WrongDimension {
                expected: EMBEDDING_DIM,
                actual: values.len(),
            });
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(InvalidEmbedding::NonFinite { index });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// An enrolled identity as listed by the gallery store. The embedding is
/// unvalidated; the gallery drops malformed entries at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub id: IdentityId,
    pub name: String,
    pub embedding: Vec<f32>,
}

/// Outcome of matching one probe embedding against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Unmatched,
    Matched {
        identity: IdentityId,
        name: String,
        /// Euclidean distance to the winning gallery entry.
        distance: f32,
    },
}

impl MatchResult {
    /// `1 - distance`, clamped to [0, 1]; `None` when unmatched.
    pub fn confidence(&self) -> Option<f32> {
        match self {
            Self::Unmatched => None,
            Self::Matched { distance, .. } => Some(distance_to_confidence(*distance)),
        }
    }
}

pub fn distance_to_confidence(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[axis] = 1.0;
        v
    }

    #[test]
    fn test_embedding_rejects_wrong_dimension() {
        let err = Embedding::new(vec![0.0; 127]).unwrap_err();
        assert_eq!(
            err,
            InvalidEmbedding::WrongDimension { expected: 128, actual: 127 }
        );
    }

    #[test]
    fn test_embedding_rejects_non_finite() {
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[5] = f32::NAN;
        assert_eq!(
            Embedding::new(values).unwrap_err(),
            InvalidEmbedding::NonFinite { index: 5 }
        );

        let mut values = vec![0.0; EMBEDDING_DIM];
        values[0] = f32::INFINITY;
        assert!(Embedding::new(values).is_err());
    }

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(unit(3)).unwrap();
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_euclidean_distance_orthogonal_units() {
        let a = Embedding::new(unit(0)).unwrap();
        let b = Embedding::new(unit(1)).unwrap();
        assert!((a.euclidean_distance(&b) - 2f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_bbox_scaled() {
        let b = BoundingBox { x: 10.0, y: 20.0, width: 30.0, height: 40.0, confidence: 0.9 };
        let s = b.scaled(4.0);
        assert_eq!((s.x, s.y, s.width, s.height), (40.0, 80.0, 120.0, 160.0));
        assert_eq!(s.confidence, 0.9);
        assert_eq!(s.right(), 160.0);
        assert_eq!(s.bottom(), 240.0);
    }

    #[test]
    fn test_match_confidence() {
        let m = MatchResult::Matched { identity: 1, name: "A".into(), distance: 0.3 };
        assert!((m.confidence().unwrap() - 0.7).abs() < 1e-6);
        assert_eq!(MatchResult::Unmatched.confidence(), None);
        assert_eq!(distance_to_confidence(1.7), 0.0);
    }
}
