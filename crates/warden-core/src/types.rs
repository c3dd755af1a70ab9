use serde::{Deserialize, Serialize};

/// Dimensionality of the embeddings produced by the ArcFace model.
pub const EMBEDDING_DIM: usize = 512;

/// Pixel-space bounding box of a detected face, corner form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceBox {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// Face embedding vector (L2-normalized, [`EMBEDDING_DIM`] floats).
///
/// Serializes transparently as a bare float array; this is the format of
/// the persisted embedding column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Compute cosine similarity against another embedding.
    ///
    /// Returns a value in [-1, 1]; higher means more similar. A zero
    /// vector on either side yields 0.0 rather than NaN.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Whether this embedding has the dimensionality the matcher expects.
    pub fn has_expected_dim(&self) -> bool {
        self.values.len() == EMBEDDING_DIM
    }
}
