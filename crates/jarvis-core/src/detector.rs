//! Face detection via ONNX Runtime.
//!
//! Runs an UltraFace-style detector (`version-RFB-320`): a 320x240 input,
//! one `scores` output `[1, N, 2]` (background, face) and one `boxes`
//! output `[1, N, 4]` with corner coordinates normalised to `[0, 1]`.
//! Candidates above the confidence threshold go through NMS.

use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_WIDTH: u32 = 320;
const INPUT_HEIGHT: u32 = 240;
const INPUT_MEAN: f32 = 127.0;
const INPUT_STD: f32 = 128.0;
const DEFAULT_CONFIDENCE: f32 = 0.7;
const DEFAULT_NMS_THRESHOLD: f32 = 0.3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds face rectangles in a grayscale frame.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Scored candidate in frame coordinates, before NMS.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    x0: f32,
    y0: f32,
    x1: f32,
    y1: f32,
    score: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x1 - self.x0).max(0.0) * (self.y1 - self.y0).max(0.0)
    }

    fn to_box(self) -> BoundingBox {
        BoundingBox::new(
            self.x0.round() as i32,
            self.y0.round() as i32,
            self.x1.round() as i32,
            self.y1.round() as i32,
        )
    }
}

pub struct UltraFaceDetector {
    session: Session,
    scores_idx: usize,
    boxes_idx: usize,
    confidence: f32,
    nms_threshold: f32,
}

impl UltraFaceDetector {
    /// Load the detector model from `model_path`.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 2 {
            return Err(DetectorError::InferenceFailed(format!(
                "detector needs scores and boxes outputs, got {output_names:?}"
            )));
        }
        let (scores_idx, boxes_idx) = discover_output_indices(&output_names);

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            scores_idx,
            boxes_idx,
            "loaded face detector"
        );

        Ok(Self {
            session,
            scores_idx,
            boxes_idx,
            confidence: DEFAULT_CONFIDENCE,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
        })
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    fn preprocess(frame: &GrayImage) -> Array4<f32> {
        let resized = image::imageops::resize(frame, INPUT_WIDTH, INPUT_HEIGHT, FilterType::Triangle);
        let (w, h) = (INPUT_WIDTH as usize, INPUT_HEIGHT as usize);
        let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let normalized = (pixel.0[0] as f32 - INPUT_MEAN) / INPUT_STD;
            // Grayscale → 3-channel
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = normalized;
            }
        }
        tensor
    }
}

impl FaceDetector for UltraFaceDetector {
    fn detect(&mut self, frame: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let input = Self::preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, scores) = outputs[self.scores_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("scores: {e}")))?;
        let (_, boxes) = outputs[self.boxes_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("boxes: {e}")))?;

        let candidates = decode(scores, boxes, frame.width(), frame.height(), self.confidence);
        let kept = nms(candidates, self.nms_threshold);
        tracing::trace!(faces = kept.len(), "detection done");

        Ok(kept
            .into_iter()
            .map(|c| c.to_box().clamp_to(frame.width(), frame.height()))
            .filter(|b| b.width() > 0 && b.height() > 0)
            .collect())
    }
}

/// Locate the `scores` and `boxes` outputs by name, else assume `[scores, boxes]`.
fn discover_output_indices(names: &[String]) -> (usize, usize) {
    let find = |target: &str| names.iter().position(|n| n == target);
    match (find("scores"), find("boxes")) {
        (Some(s), Some(b)) => (s, b),
        _ => {
            tracing::info!(?names, "detector output names not recognised, using positional [scores, boxes]");
            (0, 1)
        }
    }
}

/// Turn raw outputs into frame-space candidates above `threshold`.
fn decode(scores: &[f32], boxes: &[f32], width: u32, height: u32, threshold: f32) -> Vec<Candidate> {
    let (w, h) = (width as f32, height as f32);
    scores
        .chunks_exact(2)
        .zip(boxes.chunks_exact(4))
        .filter(|(s, _)| s[1] > threshold)
        .map(|(s, b)| Candidate {
            x0: b[0] * w,
            y0: b[1] * h,
            x1: b[2] * w,
            y1: b[3] * h,
            score: s[1],
        })
        .collect()
}

fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<Candidate> = Vec::new();
    for c in candidates {
        if keep.iter().all(|k| iou(k, &c) <= iou_threshold) {
            keep.push(c);
        }
    }
    keep
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let inter = Candidate {
        x0: a.x0.max(b.x0),
        y0: a.y0.max(b.y0),
        x1: a.x1.min(b.x1),
        y1: a.y1.min(b.y1),
        score: 0.0,
    }
    .area();
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
