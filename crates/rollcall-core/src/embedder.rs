//! ArcFace face embedder via ONNX Runtime.
//!
//! Extracts L2-normalized 512-dimensional embeddings from aligned face crops
//! using the w600k_r50 ArcFace model.

use crate::alignment;
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric normalization, unlike SCRFD's 128.0
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns a detected face into a fixed-length embedding.
///
/// `Ok(None)` means this box cannot produce an embedding (e.g. the detector
/// supplied no landmarks for alignment); the caller drops the box and moves
/// on. `Err` is a capability failure worth one retry.
pub trait FaceEmbedder {
    fn embed(
        &mut self,
        image: &RgbImage,
        face: &BoundingBox,
    ) -> Result<Option<Embedding>, EmbedError>;

    /// Embedding dimension this capability produces.
    fn dim(&self) -> usize;
}

/// ArcFace-based embedder over aligned RGB crops.
pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded ArcFace model");

        Ok(Self { session })
    }

    /// Preprocess a 112×112 aligned RGB crop into an NCHW float tensor.
    fn preprocess(aligned: &RgbImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in aligned.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }

        tensor
    }
}

impl FaceEmbedder for ArcFaceEmbedder {
    fn embed(
        &mut self,
        image: &RgbImage,
        face: &BoundingBox,
    ) -> Result<Option<Embedding>, EmbedError> {
        // Alignment needs the detector's five landmarks; a box without them
        // is unusable rather than an error.
        let Some(landmarks) = face.landmarks.as_ref() else {
            return Ok(None);
        };

        let aligned = alignment::align_face(image, landmarks);
        let input = Self::preprocess(&aligned);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EmbedError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        // L2-normalize so Euclidean distances are comparable across frames.
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values: Vec<f32> = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw.to_vec()
        };

        Ok(Some(Embedding {
            values,
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        }))
    }

    fn dim(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let aligned = RgbImage::from_pixel(112, 112, Rgb([128, 128, 128]));
        let tensor = ArcFaceEmbedder::preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let aligned = RgbImage::from_pixel(112, 112, Rgb([128, 128, 128]));
        let tensor = ArcFaceEmbedder::preprocess(&aligned);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        let value = tensor[[0, 0, 0, 0]];
        assert!((value - expected).abs() < 1e-6, "got {value}, expected {expected}");
    }

    #[test]
    fn test_preprocess_channel_order() {
        let aligned = RgbImage::from_pixel(112, 112, Rgb([255, 128, 0]));
        let tensor = ArcFaceEmbedder::preprocess(&aligned);
        assert!(tensor[[0, 0, 0, 0]] > 0.9); // red channel near +1
        assert!(tensor[[0, 2, 0, 0]] < -0.9); // blue channel near -1
    }
}
