//! Detection plus encoding behind a single capability.
//!
//! The frame pipeline only needs "faces with their embeddings" per frame;
//! tests substitute a scripted model.

use crate::detector::{DetectorError, FaceDetector};
use crate::encoder::{EncoderError, FaceEncoder};
use crate::types::BoundingBox;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("encoder: {0}")]
    Encoder(#[from] EncoderError),
}

/// A face found in a frame, in that frame's pixel coordinates.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
}

pub trait FaceModel: Send {
    /// Find every face in `image` and compute its embedding.
    fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, ModelError>;
}

pub struct OnnxFaceModel {
    detector: FaceDetector,
    encoder: FaceEncoder,
}

impl OnnxFaceModel {
    pub fn load(detector_path: &Path, encoder_path: &Path) -> Result<Self, ModelError> {
        let detector = FaceDetector::load(&detector_path.to_string_lossy())?;
        let encoder = FaceEncoder::load(&encoder_path.to_string_lossy())?;
        Ok(Self { detector, encoder })
    }
}

impl FaceModel for OnnxFaceModel {
    fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, ModelError> {
        let boxes = self.detector.detect(image)?;
        let mut faces = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            match self.encoder.encode(image, &bbox) {
                Ok(embedding) => faces.push(DetectedFace { bbox, embedding }),
                // Boxes decoded entirely off-frame are dropped, not fatal.
                Err(EncoderError::EmptyCrop(_)) => {
                    tracing::debug!(?bbox, "skipping face outside frame");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(faces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_reports_missing_detector() {
        let err = OnnxFaceModel::load(
            Path::new("/nonexistent/det.onnx"),
            Path::new("/nonexistent/enc.onnx"),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ModelError::Detector(DetectorError::ModelNotFound(_))));
    }
}
