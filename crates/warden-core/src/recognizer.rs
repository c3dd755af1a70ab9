//! ArcFace embedding extraction via ONNX Runtime.
//!
//! Produces L2-normalized 512-dimensional embeddings from aligned face
//! crops (w600k_r50 model).

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{Embedding, EMBEDDING_DIM};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric normalization, unlike SCRFD

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("model file not found: {0} — download from insightface and place in the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<ort::Error<ort::session::builder::SessionBuilder>> for EmbedError {
    fn from(e: ort::Error<ort::session::builder::SessionBuilder>) -> Self {
        EmbedError::Ort(e.into())
    }
}

/// ArcFace-based embedding extractor for aligned face crops.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
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

    /// Extract an embedding for a face in a grayscale frame.
    ///
    /// The face is first aligned to the canonical 112x112 position using
    /// the detector's five landmarks.
    pub fn embed(
        &mut self,
        frame: &GrayImage,
        landmarks: &[(f32, f32); 5],
    ) -> Result<Embedding, EmbedError> {
        let aligned = alignment::align_face(frame.as_raw(), frame.width(), frame.height(), landmarks);
        let input = preprocess(&aligned);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(EmbedError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        // L2-normalize so cosine similarity reduces to a dot product.
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw.to_vec()
        };

        Ok(Embedding { values })
    }
}

/// Turn a 112x112 grayscale crop into a NCHW float tensor, grayscale
/// replicated across the three channels.
fn preprocess(aligned: &[u8]) -> Array4<f32> {
    let mut tensor = Array4::<f32>::zeros((1, 3, ALIGNED_SIZE, ALIGNED_SIZE));

    for y in 0..ALIGNED_SIZE {
        for x in 0..ALIGNED_SIZE {
            let pixel = aligned.get(y * ALIGNED_SIZE + x).copied().unwrap_or(0) as f32;
            let normalized = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
            for c in 0..3 {
                tensor[[0, c, y, x]] = normalized;
            }
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_shape() {
        let aligned = vec![128u8; ALIGNED_SIZE * ALIGNED_SIZE];
        let tensor = preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, ALIGNED_SIZE, ALIGNED_SIZE]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let aligned = vec![128u8; ALIGNED_SIZE * ALIGNED_SIZE];
        let tensor = preprocess(&aligned);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 0, 0, 0]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_channels_replicated() {
        let aligned = vec![100u8; ALIGNED_SIZE * ALIGNED_SIZE];
        let tensor = preprocess(&aligned);
        for y in (0..ALIGNED_SIZE).step_by(7) {
            for x in (0..ALIGNED_SIZE).step_by(7) {
                assert_eq!(tensor[[0, 0, y, x]], tensor[[0, 1, y, x]]);
                assert_eq!(tensor[[0, 1, y, x]], tensor[[0, 2, y, x]]);
            }
        }
    }

    #[test]
    fn test_preprocess_short_input_pads_black() {
        // A truncated crop must not panic; missing pixels read as 0.
        let aligned = vec![128u8; 10];
        let tensor = preprocess(&aligned);
        let expected = (0.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 0, ALIGNED_SIZE - 1, ALIGNED_SIZE - 1]] - expected).abs() < 1e-6);
    }
}
