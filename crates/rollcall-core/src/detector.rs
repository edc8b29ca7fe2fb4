//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes the frame into a 640×640 tensor, decodes the three anchor-free
//! stride heads (8/16/32) and suppresses overlaps with NMS.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download it from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied when fitting a frame into the model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn for_frame(width: u32, height: u32) -> Self {
        let size = SCRFD_INPUT_SIZE as f32;
        let scale = (size / width as f32).min(size / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((size - new_w) / 2.0).floor(),
            pad_y: ((size - new_h) / 2.0).floor(),
        }
    }

    /// Map a point from model input space back to frame space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, threads: usize) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(threads)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                names.len()
            )));
        }

        let stride_outputs = map_outputs(&names);
        tracing::info!(path = %model_path.display(), outputs = ?names, ?stride_outputs, "loaded SCRFD model");

        Ok(Self {
            session,
            stride_outputs,
        })
    }

    /// Detect faces, returning boxes sorted by descending confidence.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }

        let letterbox = Letterbox::for_frame(frame.width(), frame.height());
        let input = preprocess(frame, &letterbox);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in SCRFD_STRIDES.iter().zip(self.stride_outputs.iter()) {
            let tensor = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let heads = StrideHeads {
                scores: tensor(score_idx, "scores")?,
                bboxes: tensor(bbox_idx, "bboxes")?,
                kps: tensor(kps_idx, "kps")?,
            };
            candidates.extend(heads.decode(stride, &letterbox));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Resize into the letterboxed NCHW tensor, RGB channel order.
fn preprocess(frame: &RgbImage, letterbox: &Letterbox) -> Array4<f32> {
    let new_w = ((frame.width() as f32 * letterbox.scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((frame.height() as f32 * letterbox.scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

    let size = SCRFD_INPUT_SIZE as usize;
    // Padding normalizes to zero.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (ox + x as usize, oy + y as usize);
        if tx >= size || ty >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }
    tensor
}

/// Map output names like `score_8`/`bbox_16`/`kps_32` to stride slots,
/// falling back to the usual positional layout [scores, bboxes, kps].
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };
    let slot = |stride: usize| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?));

    match (slot(8), slot(16), slot(32)) {
        (Some(s8), Some(s16), Some(s32)) => [s8, s16, s32],
        _ => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Raw head outputs for one stride level.
struct StrideHeads<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

impl StrideHeads<'_> {
    fn decode(&self, stride: usize, letterbox: &Letterbox) -> Vec<BoundingBox> {
        let grid_w = SCRFD_INPUT_SIZE as usize / stride;
        let grid_h = grid_w;
        let anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
        let s = stride as f32;

        (0..anchors)
            .filter_map(|idx| {
                let score = *self.scores.get(idx)?;
                if score <= SCRFD_CONFIDENCE_THRESHOLD {
                    return None;
                }
                let cell = idx / SCRFD_ANCHORS_PER_CELL;
                let cx = (cell % grid_w) as f32 * s;
                let cy = (cell / grid_w) as f32 * s;

                let d = self.bboxes.get(idx * 4..idx * 4 + 4)?;
                let (x1, y1) = letterbox.unmap(cx - d[0] * s, cy - d[1] * s);
                let (x2, y2) = letterbox.unmap(cx + d[2] * s, cy + d[3] * s);

                let landmarks = self.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                    std::array::from_fn(|i| letterbox.unmap(cx + k[i * 2] * s, cy + k[i * 2 + 1] * s))
                });

                Some(BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: score,
                    landmarks,
                })
            })
            .collect()
    }
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut keep: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if keep.iter().all(|kept| kept.iou(&candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence, landmarks: None }
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let result = nms(
            vec![
                bbox(5.0, 5.0, 100.0, 100.0, 0.8),
                bbox(0.0, 0.0, 100.0, 100.0, 0.9),
                bbox(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_unmap_roundtrip() {
        let lb = Letterbox::for_frame(320, 240);
        let (x, y) = (100.0f32, 50.0f32);
        let (rx, ry) = lb.unmap(x * lb.scale + lb.pad_x, y * lb.scale + lb.pad_y);
        assert!((rx - x).abs() < 0.1 && (ry - y).abs() < 0.1);
    }

    #[test]
    fn test_preprocess_pads_with_zero() {
        let frame = RgbImage::from_pixel(320, 160, image::Rgb([255, 128, 0]));
        let lb = Letterbox::for_frame(320, 160);
        let tensor = preprocess(&frame, &lb);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        // Top band is padding, centre is image.
        assert_eq!(tensor[[0, 0, 0, 320]], 0.0);
        for (c, value) in [255.0, 128.0, 0.0].into_iter().enumerate() {
            let expected = (value - SCRFD_MEAN) / SCRFD_STD;
            assert!((tensor[[0, c, 320, 320]] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_map_outputs_named_and_shuffled() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32", "score_32",
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
    fn test_decode_single_anchor() {
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let grid = 640 / 32;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let bboxes = vec![1.0f32; anchors * 4];
        let kps = vec![0.0f32; anchors * 10];
        // Cell (x=2, y=1), first anchor.
        let idx = (grid + 2) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;

        let heads = StrideHeads { scores: &scores, bboxes: &bboxes, kps: &kps };
        let dets = heads.decode(32, &lb);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert!((d.x - 32.0).abs() < 1e-4 && (d.y - 0.0).abs() < 1e-4);
        assert!((d.width - 64.0).abs() < 1e-4 && (d.height - 64.0).abs() < 1e-4);
        assert_eq!(d.landmarks.map(|l| l[0]), Some((64.0, 32.0)));
    }
}
