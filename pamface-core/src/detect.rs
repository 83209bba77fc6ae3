use crate::runtime::OnnxRuntime;
use image::{imageops, GrayImage};
use ort::session::Session;
use ort::value::Value;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Runtime error: {0}")]
    Runtime(#[from] crate::runtime::RuntimeError),
}

const INPUT_SIZE: u32 = 640;

/// SCRFD uses 3 feature pyramid levels with different strides
const FEATURE_STRIDES: [usize; 3] = [8, 16, 32];
const NUM_ANCHORS: usize = 2; // SCRFD uses 2 anchors per location

/// Overlap above which two candidates describe the same face
const GROUP_IOU: f32 = 0.4;

/// Parameters a detector runs with on every frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionParams {
    /// Pyramid step between scanned scales; 1.0 or less scans one scale
    pub scale_factor: f32,
    /// Supporting candidates a region needs to be reported.
    ///
    /// SCRFD fires on every anchor inside a face, so a face usually collects
    /// far more than 5 overlapping candidates across both pyramid levels.
    /// A face filling most of the frame is covered mainly by stride-32
    /// anchors and collects the fewest; when it falls short the loop predicts
    /// on the full frame instead.
    pub min_neighbors: usize,
    /// Smallest reported width and height, in pixels
    pub min_size: u32,
    pub confidence_threshold: f32,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 5,
            min_size: 30,
            confidence_threshold: 0.5,
        }
    }
}

/// Rectangle within a frame, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    /// Copy this region out of `frame`, clipped to its bounds
    pub fn crop(&self, frame: &GrayImage) -> GrayImage {
        let x = self.x.min(frame.width());
        let y = self.y.min(frame.height());
        let width = self.width.min(frame.width() - x);
        let height = self.height.min(frame.height() - y);
        imageops::crop_imm(frame, x, y, width, height).to_image()
    }
}

/// Finds face regions in grayscale frames.
pub trait FaceDetector {
    /// Detect faces, best first. No faces is an empty vector, not an error.
    fn detect(
        &mut self,
        frame: &GrayImage,
        params: &DetectionParams,
    ) -> Result<Vec<FaceRegion>, DetectionError>;
}

/// Raw detector output before grouping, in frame coordinates.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl Candidate {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn iou(&self, other: &Candidate) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// Round to whole pixels and clip to a `width`×`height` frame
    fn to_region(&self, width: u32, height: u32) -> Option<FaceRegion> {
        let x1 = self.x.max(0.0).round() as u32;
        let y1 = self.y.max(0.0).round() as u32;
        let x2 = ((self.x + self.width).round().max(0.0) as u32).min(width);
        let y2 = ((self.y + self.height).round().max(0.0) as u32).min(height);

        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        Some(FaceRegion {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        })
    }
}

/// Collapse overlapping candidates into regions.
///
/// The most confident candidate of each group is kept when at least
/// `params.min_neighbors` other candidates overlap it; regions narrower or
/// shorter than `params.min_size` are dropped. Output is ordered by confidence.
pub fn group_candidates(
    mut candidates: Vec<Candidate>,
    params: &DetectionParams,
    frame_width: u32,
    frame_height: u32,
) -> Vec<FaceRegion> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut regions = Vec::new();
    let mut suppressed = vec![false; candidates.len()];

    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }

        let mut neighbors = 0;
        for j in (i + 1)..candidates.len() {
            if suppressed[j] {
                continue;
            }

            if candidates[i].iou(&candidates[j]) > GROUP_IOU {
                suppressed[j] = true;
                neighbors += 1;
            }
        }

        if neighbors < params.min_neighbors {
            log::trace!(
                "Dropping candidate with {} neighbors (need {})",
                neighbors,
                params.min_neighbors
            );
            continue;
        }

        if let Some(region) = candidates[i].to_region(frame_width, frame_height) {
            if region.width >= params.min_size && region.height >= params.min_size {
                regions.push(region);
            }
        }
    }

    regions
}

/// SCRFD face detector running on ONNX Runtime.
///
/// SCRFD covers face scales through its stride pyramid. One extra pass on the
/// frame shrunk by `scale_factor` adds support for grouping.
pub struct ScrfdDetector {
    session: Session,
}

impl ScrfdDetector {
    /// Create a new face detector from model path
    pub fn new<P: AsRef<Path>>(model_path: P, runtime: &OnnxRuntime) -> Result<Self, DetectionError> {
        let session = runtime
            .create_session(model_path)
            .map_err(|e| DetectionError::ModelLoad(e.to_string()))?;

        Ok(Self { session })
    }

    /// Run the network on `frame` shrunk by `level` and decode every
    /// candidate above `confidence_threshold`
    fn candidates(
        &mut self,
        frame: &GrayImage,
        level: f32,
        confidence_threshold: f32,
    ) -> Result<Vec<Candidate>, DetectionError> {
        let (input_tensor, scale_x, scale_y) = preprocess(frame, level);

        let input_value = Value::from_array(input_tensor).map_err(|e| {
            DetectionError::Inference(format!("Failed to create input tensor: {}", e))
        })?;

        // SCRFD models expect the input tensor to be named "input.1"
        let outputs = self
            .session
            .run(ort::inputs!["input.1" => input_value])
            .map_err(|e| DetectionError::Inference(e.to_string()))?;

        if outputs.len() < FEATURE_STRIDES.len() * 2 {
            return Err(DetectionError::Inference(format!(
                "Expected at least {} outputs, got {}",
                FEATURE_STRIDES.len() * 2,
                outputs.len()
            )));
        }

        let mut candidates = Vec::new();

        // Output indices: ALL scores (0-2), then ALL bboxes (3-5)
        for (stride_idx, &stride) in FEATURE_STRIDES.iter().enumerate() {
            let feat_size = INPUT_SIZE as usize / stride;
            let anchors = generate_anchors(stride, feat_size);

            let (_, score_data) = outputs[stride_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| {
                    DetectionError::Inference(format!(
                        "Failed to extract scores for stride {}: {}",
                        stride, e
                    ))
                })?;

            let (_, bbox_data) = outputs[stride_idx + FEATURE_STRIDES.len()]
                .try_extract_tensor::<f32>()
                .map_err(|e| {
                    DetectionError::Inference(format!(
                        "Failed to extract bboxes for stride {}: {}",
                        stride, e
                    ))
                })?;

            for (anchor_idx, &anchor) in anchors.iter().enumerate() {
                for anchor_num in 0..NUM_ANCHORS {
                    let idx = anchor_idx * NUM_ANCHORS + anchor_num;

                    let Some(&raw_score) = score_data.get(idx) else {
                        continue;
                    };
                    let score = 1.0 / (1.0 + (-raw_score).exp());
                    if score < confidence_threshold {
                        continue;
                    }

                    let bbox_offset = idx * 4;
                    let Some(bbox_pred) = bbox_data.get(bbox_offset..bbox_offset + 4) else {
                        continue;
                    };
                    let (x, y, w, h) = decode_bbox(anchor, bbox_pred);

                    candidates.push(Candidate {
                        x: x / scale_x,
                        y: y / scale_y,
                        width: w / scale_x,
                        height: h / scale_y,
                        confidence: score,
                    });
                }
            }
        }

        Ok(candidates)
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(
        &mut self,
        frame: &GrayImage,
        params: &DetectionParams,
    ) -> Result<Vec<FaceRegion>, DetectionError> {
        let mut candidates = Vec::new();
        for level in pyramid_levels(params.scale_factor) {
            candidates.extend(self.candidates(frame, level, params.confidence_threshold)?);
        }
        log::trace!("Found {} candidates before grouping", candidates.len());

        let regions = group_candidates(candidates, params, frame.width(), frame.height());
        log::debug!("Detected {} face region(s)", regions.len());
        Ok(regions)
    }
}

/// Generate anchor centers for a given stride
fn generate_anchors(stride: usize, feat_size: usize) -> Vec<(f32, f32)> {
    let mut anchors = Vec::with_capacity(feat_size * feat_size);
    for i in 0..feat_size {
        for j in 0..feat_size {
            let cx = (j as f32 + 0.5) * stride as f32;
            let cy = (i as f32 + 0.5) * stride as f32;
            anchors.push((cx, cy));
        }
    }
    anchors
}

/// Decode SCRFD bounding box predictions from anchor-relative format
fn decode_bbox(anchor: (f32, f32), pred: &[f32]) -> (f32, f32, f32, f32) {
    let (cx, cy) = anchor;

    let x1 = cx - pred[0].abs();
    let y1 = cy - pred[1].abs();
    let x2 = cx + pred[2].abs();
    let y2 = cy + pred[3].abs();

    (x1, y1, x2 - x1, y2 - y1)
}

/// Scales the detector runs at: the full input, then one step down
fn pyramid_levels(scale_factor: f32) -> Vec<f32> {
    if scale_factor > 1.0 {
        vec![1.0, scale_factor]
    } else {
        vec![1.0]
    }
}

/// Resize to the network input shrunk by `level`, pad the rest with black and
/// replicate luma into three channels
fn preprocess(frame: &GrayImage, level: f32) -> (([usize; 4], Vec<f32>), f32, f32) {
    let (orig_width, orig_height) = frame.dimensions();
    let side = ((INPUT_SIZE as f32 / level).round() as u32).clamp(1, INPUT_SIZE);

    let resized = imageops::resize(frame, side, side, imageops::FilterType::Triangle);
    let mut canvas = GrayImage::new(INPUT_SIZE, INPUT_SIZE);
    imageops::replace(&mut canvas, &resized, 0, 0);

    let scale_x = side as f32 / orig_width as f32;
    let scale_y = side as f32 / orig_height as f32;

    let plane: Vec<f32> = canvas.pixels().map(|p| p[0] as f32 / 255.0).collect();
    let mut input_data = Vec::with_capacity(plane.len() * 3);
    for _ in 0..3 {
        input_data.extend_from_slice(&plane);
    }

    let shape = [1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize];
    ((shape, input_data), scale_x, scale_y)
}
