//! warden-core — Face detection, embedding extraction and matching.
//!
//! Uses SCRFD for face detection and ArcFace for embedding extraction,
//! both running via ONNX Runtime for CPU inference. The [`FaceExtractor`]
//! trait is the seam the streaming daemon programs against.

pub mod alignment;
pub mod detector;
pub mod extractor;
pub mod matcher;
pub mod recognizer;
pub mod types;

pub use extractor::{ExtractError, Face, FaceExtractor, OnnxExtractor};
pub use matcher::{CosineMatcher, Matcher};
pub use types::{Embedding, FaceBox, EMBEDDING_DIM};
