//! Per-frame processing: decode, extract, match, annotate, log.
//!
//! One [`FrameProcessor::process`] call handles one frame end to end.
//! All faces in a frame are matched against a single cache snapshot, so
//! a concurrent reload can never mix old and new identities within one
//! frame's results. Log writes are enqueued fire-and-forget and never
//! delay the response.

use crate::cache::{KnownFaceCache, KnownFaceSnapshot};
use crate::jobs::{Job, JobQueue};
use base64::prelude::*;
use image::{DynamicImage, RgbImage};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use warden_core::{CosineMatcher, ExtractError, Face, FaceExtractor, Matcher};

/// Sentinel display name for a face no known identity matched.
pub const STRANGER: &str = "Stranger";

/// Annotation palette: green for matches, red for strangers.
const MATCH_COLOR: [u8; 3] = [16, 185, 129];
const STRANGER_COLOR: [u8; 3] = [239, 68, 68];
const BOX_THICKNESS: i32 = 2;
const LABEL_STRIP_HEIGHT: i32 = 24;
const JPEG_QUALITY: u8 = 85;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractError),
    #[error("frame processing timed out")]
    Timeout,
    #[error("frame processing failed: {0}")]
    Internal(String),
}

/// One recognized (or unrecognized) face in a frame.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
    pub name: String,
    /// Pixel coordinates as [top, right, bottom, left].
    pub location: [i32; 4],
    pub matched: bool,
    /// Identity reference captured at match time; `None` for strangers.
    /// Internal — log linkage only, not part of the wire format.
    #[serde(skip)]
    pub identity_id: Option<Uuid>,
}

/// Result of processing one frame.
#[derive(Debug)]
pub struct FrameOutput {
    pub detections: Vec<DetectionResult>,
    /// Base64 JPEG with boxes and label strips burned in, when enabled.
    pub annotated_frame: Option<String>,
}

/// Orchestrates the detect → match → annotate → log cycle for one frame.
pub struct FrameProcessor {
    extractor: Arc<dyn FaceExtractor>,
    cache: Arc<KnownFaceCache>,
    jobs: JobQueue,
    threshold: f32,
    annotate: bool,
}

impl FrameProcessor {
    pub fn new(
        extractor: Arc<dyn FaceExtractor>,
        cache: Arc<KnownFaceCache>,
        jobs: JobQueue,
        threshold: f32,
        annotate: bool,
    ) -> Self {
        Self { extractor, cache, jobs, threshold, annotate }
    }

    /// Process one base64-encoded frame.
    ///
    /// A malformed frame fails the whole call with no partial result and
    /// no log writes. Zero detected faces is a normal empty result.
    pub async fn process(&self, frame_b64: &str) -> Result<FrameOutput, FrameError> {
        let bytes = BASE64_STANDARD
            .decode(frame_b64)
            .map_err(|e| FrameError::Decode(e.to_string()))?;

        // Image decode and inference are CPU-bound; keep them off the
        // session's runtime threads.
        let extractor = self.extractor.clone();
        let (image, faces) = tokio::task::spawn_blocking(move || {
            let image = image::load_from_memory(&bytes)
                .map_err(|e| FrameError::Decode(e.to_string()))?;
            let faces = extractor.extract(&image)?;
            Ok::<_, FrameError>((image, faces))
        })
        .await
        .map_err(|e| FrameError::Internal(e.to_string()))??;

        // One snapshot per frame, shared by every face in it.
        let snapshot = self.cache.snapshot();

        let mut detections = Vec::with_capacity(faces.len());
        for face in &faces {
            let detection = self.match_face(&snapshot, face);
            self.jobs.enqueue(Job::WriteLog {
                identity_id: detection.identity_id,
                display_name: detection.name.clone(),
                message: log_message(&detection),
                matched: detection.matched,
            });
            detections.push(detection);
        }

        let annotated_frame = if self.annotate {
            Some(annotate(&image, &detections)?)
        } else {
            None
        };

        Ok(FrameOutput { detections, annotated_frame })
    }

    fn match_face(&self, snapshot: &KnownFaceSnapshot, face: &Face) -> DetectionResult {
        let bbox = &face.bbox;
        let location = [bbox.top, bbox.right, bbox.bottom, bbox.left];

        match CosineMatcher.best_match(&face.embedding, &snapshot.embeddings, self.threshold) {
            Some(idx) => DetectionResult {
                name: snapshot.names[idx].clone(),
                location,
                matched: true,
                identity_id: Some(snapshot.identity_ids[idx]),
            },
            None => DetectionResult {
                name: STRANGER.to_string(),
                location,
                matched: false,
                identity_id: None,
            },
        }
    }
}

fn log_message(detection: &DetectionResult) -> String {
    if detection.matched {
        format!("Recognition successful for {}", detection.name)
    } else {
        "New Stranger detected".to_string()
    }
}

/// Burn detection boxes and label strips into the frame, returning it as
/// base64 JPEG.
fn annotate(image: &DynamicImage, detections: &[DetectionResult]) -> Result<String, FrameError> {
    let mut rgb = image.to_rgb8();

    for det in detections {
        let color = if det.matched { MATCH_COLOR } else { STRANGER_COLOR };
        let [top, right, bottom, left] = det.location;
        draw_box(&mut rgb, left, top, right, bottom, color);
        // Label strip along the bottom edge of the box.
        fill_rect(&mut rgb, left, bottom - LABEL_STRIP_HEIGHT, right, bottom, color);
    }

    let mut bytes = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut bytes);
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, JPEG_QUALITY);
    rgb.write_with_encoder(encoder)
        .map_err(|e| FrameError::Internal(format!("annotated frame encode: {e}")))?;

    Ok(BASE64_STANDARD.encode(bytes))
}

/// Hollow rectangle, `BOX_THICKNESS` pixels thick, clamped to the image.
fn draw_box(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: [u8; 3]) {
    for t in 0..BOX_THICKNESS {
        fill_rect(image, left, top + t, right, top + t + 1, color);
        fill_rect(image, left, bottom - t - 1, right, bottom - t, color);
        fill_rect(image, left + t, top, left + t + 1, bottom, color);
        fill_rect(image, right - t - 1, top, right - t, bottom, color);
    }
}

/// Filled rectangle over [x1, x2) × [y1, y2), clamped to the image.
fn fill_rect(image: &mut RgbImage, x1: i32, y1: i32, x2: i32, y2: i32, color: [u8; 3]) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    let x_start = x1.clamp(0, w);
    let x_end = x2.clamp(0, w);
    let y_start = y1.clamp(0, h);
    let y_end = y2.clamp(0, h);

    for y in y_start..y_end {
        for x in x_start..x_end {
            image.put_pixel(x as u32, y as u32, image::Rgb(color));
        }
    }
}
