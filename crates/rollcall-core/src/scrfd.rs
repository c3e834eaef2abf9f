//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three strides, NMS, and five landmarks per
//! face (left eye, right eye, nose, left mouth corner, right mouth corner).

use crate::detector::DetectorError;
use crate::types::{BoundingBox, FaceDetection, Landmark};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
pub const SCRFD_LANDMARKS: usize = 5;
const KPS_WIDTH: usize = SCRFD_LANDMARKS * 2;

/// Scale and padding applied when fitting the frame into the square input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize, target: usize) -> (Self, usize, usize) {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as usize).clamp(1, target);
        let new_h = ((height as f32 * scale).round() as usize).clamp(1, target);
        let letterbox = Self {
            scale,
            pad_x: (target - new_w) as f32 / 2.0,
            pad_y: (target - new_h) as f32 / 2.0,
        };
        (letterbox, new_w, new_h)
    }

    /// Map a point from model input space back to frame pixels.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

pub struct ScrfdModel {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
}

impl ScrfdModel {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                output_names.len()
            )));
        }

        let stride_outputs = discover_output_indices(&output_names);
        tracing::info!(path = %model_path.display(), outputs = ?output_names, ?stride_outputs, "loaded SCRFD model");

        Ok(Self {
            session,
            stride_outputs,
        })
    }

    /// Detect faces, highest confidence first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>, DetectorError> {
        let (input, letterbox) = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_outputs[slot];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("landmarks stride {stride}: {e}")))?;

            candidates.extend(decode_stride(scores, bboxes, kps, stride, &letterbox));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox the RGB frame into a normalized 1x3x640x640 tensor.
fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let (letterbox, new_w, new_h) =
        Letterbox::fit(image.width() as usize, image.height() as usize, SCRFD_INPUT_SIZE);
    let resized = imageops::resize(image, new_w as u32, new_h as u32, FilterType::Triangle);

    let x0 = letterbox.pad_x.floor() as usize;
    let y0 = letterbox.pad_y.floor() as usize;

    // Padding is zero after normalization, i.e. SCRFD_MEAN.
    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (x0 + x as usize, y0 + y as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

/// Map stride slots to output tensors by name ("score_8", "bbox_16", ...),
/// falling back to the export's positional layout
/// `[scores 8/16/32, bboxes 8/16/32, kps 8/16/32]`.
fn discover_output_indices(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named.as_deref() {
        Some(&[s8, s16, s32]) => [s8, s16, s32],
        _ => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional layout");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<FaceDetection> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut detections = Vec::new();
    for idx in 0..anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= SCRFD_CONFIDENCE_THRESHOLD {
            continue;
        }

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid_w) as f32 * s;
        let ay = (cell / grid_w) as f32 * s;

        let Some(d) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };
        let Some(k) = kps.get(idx * KPS_WIDTH..(idx + 1) * KPS_WIDTH) else {
            continue;
        };

        let top_left = letterbox.unmap(ax - d[0] * s, ay - d[1] * s);
        let bottom_right = letterbox.unmap(ax + d[2] * s, ay + d[3] * s);

        let landmarks = k
            .chunks_exact(2)
            .map(|p| {
                let (x, y) = letterbox.unmap(ax + p[0] * s, ay + p[1] * s);
                Landmark::new(x as f64, y as f64)
            })
            .collect();

        detections.push(FaceDetection {
            bbox: BoundingBox::from_corners(top_left, bottom_right),
            confidence: score,
            landmarks,
            encoding: None,
        });
    }

    detections
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn nms(mut detections: Vec<FaceDetection>, iou_threshold: f32) -> Vec<FaceDetection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceDetection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(&k.bbox, &det.bbox) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let (ax2, ay2) = a.bottom_right();
    let (bx2, by2) = b.bottom_right();
    let inter = BoundingBox::from_corners((a.x.max(b.x), a.y.max(b.y)), (ax2.min(bx2), ay2.min(by2)));
    let inter_area = inter.area();
    let union = a.area() + b.area() - inter_area;
    if union > 0.0 {
        inter_area / union
    } else {
        0.0
    }
}
