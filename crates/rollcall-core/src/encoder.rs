//! 128-dimensional face encoder via ONNX Runtime.
//!
//! Faces are cropped from the frame around the detector box with a small
//! margin, resized to the encoder's square input and embedded. Output vectors
//! are L2-normalized so that Euclidean distances fall in [0, 2].

use crate::types::{BoundingBox, EMBEDDING_DIM};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ENCODER_INPUT_SIZE: u32 = 150;
const ENCODER_MEAN: f32 = 127.5;
const ENCODER_STD: f32 = 128.0;
/// Fraction of the box size added on each side before cropping.
const CROP_MARGIN: f32 = 0.15;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box {0:?} lies outside the frame")]
    EmptyCrop(BoundingBox),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceEncoder {
    session: Session,
}

impl FaceEncoder {
    /// Load the encoder ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EncoderError> {
        if !Path::new(model_path).exists() {
            return Err(EncoderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face encoder model"
        );

        Ok(Self { session })
    }

    /// Compute the embedding of the face inside `face` in an RGB frame.
    pub fn encode(&mut self, frame: &RgbImage, face: &BoundingBox) -> Result<Vec<f32>, EncoderError> {
        let crop = crop_face(frame, face).ok_or(EncoderError::EmptyCrop(*face))?;
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(EncoderError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(l2_normalize(raw.to_vec()))
    }
}

/// Crop `face` plus margin, clamped to the frame, and resize it to the
/// encoder input. `None` when nothing of the box is inside the frame.
fn crop_face(frame: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let (fw, fh) = (frame.width() as f32, frame.height() as f32);
    let mx = face.width * CROP_MARGIN;
    let my = face.height * CROP_MARGIN;

    let x0 = (face.x - mx).max(0.0);
    let y0 = (face.y - my).max(0.0);
    let x1 = (face.right() + mx).min(fw);
    let y1 = (face.bottom() + my).min(fh);

    let w = (x1 - x0).floor();
    let h = (y1 - y0).floor();
    if w < 1.0 || h < 1.0 {
        return None;
    }

    let cropped = imageops::crop_imm(frame, x0 as u32, y0 as u32, w as u32, h as u32).to_image();
    Some(imageops::resize(
        &cropped,
        ENCODER_INPUT_SIZE,
        ENCODER_INPUT_SIZE,
        FilterType::Triangle,
    ))
}

/// Convert a square RGB crop into a normalized 1×3×N×N tensor.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = ENCODER_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in crop.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        if x >= size || y >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, y, x]] = (pixel.0[c] as f32 - ENCODER_MEAN) / ENCODER_STD;
        }
    }
    tensor
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.into_iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn face(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9 }
    }

    #[test]
    fn test_crop_resizes_to_input() {
        let frame = RgbImage::from_pixel(640, 480, Rgb([10, 20, 30]));
        let crop = crop_face(&frame, &face(100.0, 100.0, 80.0, 100.0)).unwrap();
        assert_eq!(crop.dimensions(), (ENCODER_INPUT_SIZE, ENCODER_INPUT_SIZE));
        assert_eq!(crop.get_pixel(75, 75), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_crop_clamps_at_edges() {
        let frame = RgbImage::new(64, 64);
        // Partially outside on the top-left still yields a crop
        assert!(crop_face(&frame, &face(-20.0, -20.0, 40.0, 40.0)).is_some());
    }

    #[test]
    fn test_crop_outside_frame_is_none() {
        let frame = RgbImage::new(64, 64);
        assert!(crop_face(&frame, &face(200.0, 200.0, 30.0, 30.0)).is_none());
    }

    #[test]
    fn test_preprocess_shape_and_normalization() {
        let crop = RgbImage::from_pixel(ENCODER_INPUT_SIZE, ENCODER_INPUT_SIZE, Rgb([255, 128, 0]));
        let tensor = preprocess(&crop);
        let n = ENCODER_INPUT_SIZE as usize;
        assert_eq!(tensor.shape(), &[1, 3, n, n]);
        assert!((tensor[[0, 0, 5, 5]] - 127.5 / 128.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] - 0.5 / 128.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 5, 5]] + 127.5 / 128.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_unit_length() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector_unchanged() {
        assert_eq!(l2_normalize(vec![0.0; 4]), vec![0.0; 4]);
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceEncoder::load("/nonexistent/encoder.onnx").err().unwrap();
        assert!(matches!(err, EncoderError::ModelNotFound(_)));
    }
}
