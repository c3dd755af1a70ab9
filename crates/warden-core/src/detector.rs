//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three stride levels with NMS post-processing.
//! Operates on the luminance plane of the incoming frame; detections carry
//! the five-point landmarks the aligner needs.

use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const DET_INPUT_SIZE: usize = 640;
const DET_MEAN: f32 = 127.5;
const DET_STD: f32 = 128.0;
const DET_SCORE_THRESHOLD: f32 = 0.5;
const DET_NMS_IOU: f32 = 0.4;
const DET_STRIDES: [usize; 3] = [8, 16, 32];
const DET_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("model file not found: {0} — download from insightface and place in the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<ort::Error<ort::session::builder::SessionBuilder>> for DetectError {
    fn from(e: ort::Error<ort::session::builder::SessionBuilder>) -> Self {
        DetectError::Ort(e.into())
    }
}

/// Raw detector output in original-frame pixel space, corner form.
#[derive(Debug, Clone)]
pub struct RawDetection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    /// Five-point landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Mapping from the letterboxed model input back to frame coordinates.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    /// Output tensor index of (scores, boxes, landmarks) per stride level.
    output_map: [(usize, usize, usize); 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectError> {
        if !Path::new(model_path).exists() {
            return Err(DetectError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = model_path,
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides x score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let output_map = map_outputs(&output_names);
        tracing::debug!(?output_map, "SCRFD output tensor mapping");

        Ok(Self { session, output_map })
    }

    /// Detect faces in a grayscale frame, sorted by descending confidence.
    pub fn detect(&mut self, frame: &GrayImage) -> Result<Vec<RawDetection>, DetectError> {
        let (input, letterbox) = preprocess(frame);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (level, &stride) in DET_STRIDES.iter().enumerate() {
            let (score_idx, box_idx, kps_idx) = self.output_map[level];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[box_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            decode_stride(scores, boxes, kps, stride, &letterbox, &mut candidates);
        }

        let mut result = nms(candidates, DET_NMS_IOU);
        result.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(result)
    }
}

/// Map output tensor names to (score, box, kps) slots per stride.
///
/// Recognizes the named export convention ("score_8", "bbox_16", "kps_32");
/// anything else falls back to the standard positional layout
/// [0-2]=scores, [3-5]=boxes, [6-8]=kps.
fn map_outputs(names: &[String]) -> [(usize, usize, usize); 3] {
    let find = |prefix: &str, stride: usize| names.iter().position(|n| n == &format!("{prefix}_{stride}"));

    let all_named = DET_STRIDES.iter().all(|&s| {
        find("score", s).is_some() && find("bbox", s).is_some() && find("kps", s).is_some()
    });

    if all_named {
        std::array::from_fn(|i| {
            let s = DET_STRIDES[i];
            // all_named guarantees presence
            (
                find("score", s).unwrap_or(i),
                find("bbox", s).unwrap_or(3 + i),
                find("kps", s).unwrap_or(6 + i),
            )
        })
    } else {
        tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
        [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
    }
}

/// Letterbox-resize the frame into a 640x640 NCHW tensor.
///
/// Bilinear resize preserves edge sharpness; the padding value equals the
/// model mean so padded pixels normalize to exactly zero.
fn preprocess(frame: &GrayImage) -> (Array4<f32>, Letterbox) {
    let (width, height) = (frame.width() as usize, frame.height() as usize);
    let data = frame.as_raw();

    let scale = (DET_INPUT_SIZE as f32 / width as f32).min(DET_INPUT_SIZE as f32 / height as f32);
    let new_w = (width as f32 * scale).round() as usize;
    let new_h = (height as f32 * scale).round() as usize;
    let pad_x = (DET_INPUT_SIZE - new_w) as f32 / 2.0;
    let pad_y = (DET_INPUT_SIZE - new_h) as f32 / 2.0;

    let pad_x_start = pad_x.floor() as usize;
    let pad_y_start = pad_y.floor() as usize;
    let inv_scale = 1.0 / scale;

    let mut tensor = Array4::<f32>::zeros((1, 3, DET_INPUT_SIZE, DET_INPUT_SIZE));

    for y in 0..DET_INPUT_SIZE {
        for x in 0..DET_INPUT_SIZE {
            let inside = y >= pad_y_start
                && y < pad_y_start + new_h
                && x >= pad_x_start
                && x < pad_x_start + new_w;

            let pixel = if inside {
                // Bilinear sample from the source frame.
                let src_x = ((x - pad_x_start) as f32 + 0.5) * inv_scale - 0.5;
                let src_y = ((y - pad_y_start) as f32 + 0.5) * inv_scale - 0.5;

                let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
                let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
                let x1 = (x0 + 1).min(width - 1);
                let y1 = (y0 + 1).min(height - 1);
                let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);
                let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

                let tl = data[y0 * width + x0] as f32;
                let tr = data[y0 * width + x1] as f32;
                let bl = data[y1 * width + x0] as f32;
                let br = data[y1 * width + x1] as f32;

                tl * (1.0 - fx) * (1.0 - fy)
                    + tr * fx * (1.0 - fy)
                    + bl * (1.0 - fx) * fy
                    + br * fx * fy
            } else {
                DET_MEAN
            };

            let normalized = (pixel - DET_MEAN) / DET_STD;
            // Grayscale replicated into all three channels.
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }
    }

    (tensor, Letterbox { scale, pad_x, pad_y })
}

/// Decode one stride level's anchors into frame-space detections.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    out: &mut Vec<RawDetection>,
) {
    let grid_w = DET_INPUT_SIZE / stride;
    let grid_h = DET_INPUT_SIZE / stride;
    let num_anchors = grid_w * grid_h * DET_ANCHORS_PER_CELL;

    let unmap = |x: f32, y: f32| -> (f32, f32) {
        ((x - letterbox.pad_x) / letterbox.scale, (y - letterbox.pad_y) / letterbox.scale)
    };

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= DET_SCORE_THRESHOLD {
            continue;
        }

        let cell = idx / DET_ANCHORS_PER_CELL;
        let anchor_cx = (cell % grid_w) as f32 * stride as f32;
        let anchor_cy = (cell / grid_w) as f32 * stride as f32;

        // Box offsets are distances from the anchor center, in stride units.
        let b = idx * 4;
        if b + 3 >= boxes.len() {
            continue;
        }
        let (x1, y1) = unmap(
            anchor_cx - boxes[b] * stride as f32,
            anchor_cy - boxes[b + 1] * stride as f32,
        );
        let (x2, y2) = unmap(
            anchor_cx + boxes[b + 2] * stride as f32,
            anchor_cy + boxes[b + 3] * stride as f32,
        );

        let k = idx * 10;
        let landmarks = if k + 9 < kps.len() {
            let mut points = [(0.0f32, 0.0f32); 5];
            for (i, point) in points.iter_mut().enumerate() {
                *point = unmap(
                    anchor_cx + kps[k + i * 2] * stride as f32,
                    anchor_cy + kps[k + i * 2 + 1] * stride as f32,
                );
            }
            Some(points)
        } else {
            None
        };

        out.push(RawDetection { x1, y1, x2, y2, confidence: score, landmarks });
    }
}

/// Non-Maximum Suppression over corner-form detections.
fn nms(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<RawDetection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Intersection-over-Union of two corner-form boxes.
fn iou(a: &RawDetection, b: &RawDetection) -> f32 {
    let ix1 = a.x1.max(b.x1);
    let iy1 = a.y1.max(b.y1);
    let ix2 = a.x2.min(b.x2);
    let iy2 = a.y2.min(b.y2);

    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union = area_a + area_b - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, conf: f32) -> RawDetection {
        RawDetection { x1, y1, x2, y2, confidence: conf, landmarks: None }
    }

    #[test]
    fn test_iou_identical() {
        let a = det(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = det(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = det(20.0, 20.0, 30.0, 30.0, 1.0);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = det(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = det(5.0, 0.0, 15.0, 10.0, 1.0);
        // intersection 50, union 150
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            det(0.0, 0.0, 100.0, 100.0, 0.9),
            det(5.0, 5.0, 105.0, 105.0, 0.8),
            det(200.0, 200.0, 250.0, 250.0, 0.7),
        ];
        let kept = nms(detections, 0.4);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_distinct() {
        let detections = vec![
            det(0.0, 0.0, 10.0, 10.0, 0.9),
            det(50.0, 50.0, 60.0, 60.0, 0.8),
        ];
        assert_eq!(nms(detections, 0.4).len(), 2);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_map_outputs_named() {
        let names: Vec<String> = [
            "score_8", "score_16", "score_32",
            "bbox_8", "bbox_16", "bbox_32",
            "kps_8", "kps_16", "kps_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        assert_eq!(map_outputs(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_map_outputs_named_shuffled() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        assert_eq!(map_outputs(&names), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_map_outputs_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(map_outputs(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_preprocess_uniform_frame() {
        // A uniform mid-gray frame should produce a uniform tensor where the
        // image region and the letterbox padding agree.
        let frame = GrayImage::from_pixel(320, 240, image::Luma([128u8]));
        let (tensor, letterbox) = preprocess(&frame);

        assert_eq!(tensor.shape(), &[1, 3, DET_INPUT_SIZE, DET_INPUT_SIZE]);
        assert!(letterbox.scale > 0.0);

        let expected = (128.0 - DET_MEAN) / DET_STD;
        let center = tensor[[0, 0, DET_INPUT_SIZE / 2, DET_INPUT_SIZE / 2]];
        assert!((center - expected).abs() < 1e-3);

        // Padding normalizes to zero by construction.
        let pad = tensor[[0, 0, 0, 0]];
        assert!(pad.abs() < 1e-6);
    }

    #[test]
    fn test_letterbox_roundtrip() {
        let (width, height) = (320.0f32, 240.0f32);
        let scale = (640.0 / width).min(640.0 / height);
        let pad_x = (640.0 - (width * scale).round()) / 2.0;
        let pad_y = (640.0 - (height * scale).round()) / 2.0;
        let lb = Letterbox { scale, pad_x, pad_y };

        let (orig_x, orig_y) = (100.0f32, 50.0f32);
        let mapped_x = orig_x * lb.scale + lb.pad_x;
        let mapped_y = orig_y * lb.scale + lb.pad_y;

        let back_x = (mapped_x - lb.pad_x) / lb.scale;
        let back_y = (mapped_y - lb.pad_y) / lb.scale;
        assert!((back_x - orig_x).abs() < 0.1);
        assert!((back_y - orig_y).abs() < 0.1);
    }
}
