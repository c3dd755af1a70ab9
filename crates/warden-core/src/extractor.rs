//! The detect-then-embed pipeline behind a single trait.
//!
//! [`FaceExtractor`] is what the streaming daemon and the background
//! embedding job program against; [`OnnxExtractor`] is the production
//! implementation chaining SCRFD detection with ArcFace extraction.

use crate::detector::{DetectError, FaceDetector};
use crate::recognizer::{EmbedError, FaceRecognizer};
use crate::types::{Embedding, FaceBox};
use image::DynamicImage;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("detector: {0}")]
    Detector(#[from] DetectError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] EmbedError),
}

/// One detected face: where it is and what it looks like.
#[derive(Debug, Clone)]
pub struct Face {
    pub bbox: FaceBox,
    pub embedding: Embedding,
}

/// Black-box capability: image in, zero or more (bbox, embedding) out.
///
/// Implementations must be callable concurrently from many frame cycles;
/// zero faces is a normal empty result, not an error.
pub trait FaceExtractor: Send + Sync {
    fn extract(&self, image: &DynamicImage) -> Result<Vec<Face>, ExtractError>;
}

struct Models {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

/// Production extractor running SCRFD + ArcFace via ONNX Runtime.
///
/// `ort` sessions require exclusive access for inference, so both models
/// sit behind one mutex; callers serialize at the inference call only.
pub struct OnnxExtractor {
    models: Mutex<Models>,
}

impl OnnxExtractor {
    /// Load both models. Model-load failures are fatal to the caller —
    /// the process cannot recognize anything without them.
    pub fn load(detector_path: &str, recognizer_path: &str) -> Result<Self, ExtractError> {
        let detector = FaceDetector::load(detector_path)?;
        let recognizer = FaceRecognizer::load(recognizer_path)?;
        Ok(Self {
            models: Mutex::new(Models { detector, recognizer }),
        })
    }
}

impl FaceExtractor for OnnxExtractor {
    fn extract(&self, image: &DynamicImage) -> Result<Vec<Face>, ExtractError> {
        let luma = image.to_luma8();

        let mut models = self.models.lock().unwrap_or_else(|e| e.into_inner());

        let detections = models.detector.detect(&luma)?;
        if detections.is_empty() {
            tracing::debug!("no faces detected in frame");
            return Ok(Vec::new());
        }

        let mut faces = Vec::with_capacity(detections.len());
        for det in &detections {
            let Some(landmarks) = det.landmarks.as_ref() else {
                tracing::warn!(
                    confidence = det.confidence,
                    "skipping detection without landmarks; alignment requires them"
                );
                continue;
            };

            let embedding = models.recognizer.embed(&luma, landmarks)?;
            faces.push(Face {
                bbox: FaceBox {
                    left: det.x1.round() as i32,
                    top: det.y1.round() as i32,
                    right: det.x2.round() as i32,
                    bottom: det.y2.round() as i32,
                },
                embedding,
            });
        }

        Ok(faces)
    }
}
