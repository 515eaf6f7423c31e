//! SCRFD face detector via ONNX Runtime.
//!
//! Runs the SCRFD anchor-free detector (three strides, two anchors per
//! cell) over an RGB image and turns the strongest face into a square,
//! intensity-normalized crop for the recognition stage.

use crate::alignment;
use crate::capability::{CapabilityError, FaceDetector};
use crate::frame;
use crate::types::{BoundingBox, FaceCrop};
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
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<DetectorError> for CapabilityError {
    fn from(err: DetectorError) -> Self {
        match err {
            DetectorError::Ort(e) => CapabilityError::Transient(e.to_string()),
            other => CapabilityError::Fatal(other.to_string()),
        }
    }
}

/// Detection and crop parameters.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    /// Faces whose shorter side is below this many source pixels are ignored.
    pub min_face_size: f32,
    /// Side of the square crop handed to the recognition stage.
    pub crop_size: u32,
    /// Warp the crop onto reference landmark positions when landmarks exist.
    pub align: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
            min_face_size: 20.0,
            crop_size: 240,
            align: true,
        }
    }
}

/// Maps letterboxed model coordinates back to source pixels.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((target as f32 - new_w) / 2.0).floor(),
            pad_y: ((target as f32 - new_h) / 2.0).floor(),
        }
    }

    fn to_source(&self, (x, y): (f32, f32)) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// SCRFD-based implementation of [`FaceDetector`].
pub struct ScrfdDetector {
    session: Session,
    config: DetectorConfig,
    outputs: [StrideOutputs; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str, config: DetectorConfig) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                names.len()
            )));
        }
        let outputs = map_outputs(&names);

        tracing::info!(path = model_path, outputs = ?names, mapping = ?outputs, "loaded SCRFD model");

        Ok(Self { session, config, outputs })
    }

    /// Detect all faces, strongest first.
    pub fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in self.outputs.iter().zip(SCRFD_STRIDES.iter()) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(slot.score, "scores")?;
            let bboxes = extract(slot.bbox, "bboxes")?;
            let kps = extract(slot.kps, "kps")?;
            candidates.extend(decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                &letterbox,
                self.config.confidence_threshold,
            ));
        }

        Ok(nms(candidates, self.config.nms_threshold))
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Option<FaceCrop>, CapabilityError> {
        let faces = self.detect_faces(image)?;
        let Some(face) = faces
            .into_iter()
            .find(|f| f.min_side() >= self.config.min_face_size)
        else {
            return Ok(None);
        };

        tracing::debug!(
            confidence = face.confidence,
            x = face.x,
            y = face.y,
            width = face.width,
            height = face.height,
            "face selected"
        );

        match extract_crop(image, &face, &self.config) {
            Some(image) => Ok(Some(FaceCrop {
                image,
                confidence: face.confidence,
                region: face,
            })),
            None => Ok(None),
        }
    }
}

/// Cut the face out of `image` as a square, normalized `crop_size` crop.
///
/// Uses landmark alignment when enabled and available, else the bounding
/// box clamped to the image. Returns `None` if the region is empty.
pub fn extract_crop(image: &RgbImage, face: &BoundingBox, config: &DetectorConfig) -> Option<RgbImage> {
    let aligned = match (&face.landmarks, config.align) {
        (Some(lms), true) => alignment::align_face(image, lms, config.crop_size),
        _ => None,
    };
    let mut crop = match aligned {
        Some(crop) => crop,
        None => {
            let x0 = face.x.max(0.0).floor() as u32;
            let y0 = face.y.max(0.0).floor() as u32;
            let x1 = ((face.x + face.width).ceil().max(0.0) as u32).min(image.width());
            let y1 = ((face.y + face.height).ceil().max(0.0) as u32).min(image.height());
            if x1 <= x0 || y1 <= y0 {
                return None;
            }
            let region = imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image();
            imageops::resize(&region, config.crop_size, config.crop_size, FilterType::Triangle)
        }
    };
    frame::normalize_min_max(&mut crop);
    Some(crop)
}

/// Letterbox an RGB image into the SCRFD NCHW input tensor.
fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let size = SCRFD_INPUT_SIZE;
    let letterbox = Letterbox::fit(image.width(), image.height(), size);
    let new_w = ((image.width() as f32 * letterbox.scale).round() as u32).clamp(1, size);
    let new_h = ((image.height() as f32 * letterbox.scale).round() as u32).clamp(1, size);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    // Padding stays at 0.0, which is SCRFD_MEAN after normalization.
    let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
    let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, px) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, oy + y as usize, ox + x as usize]] = (px.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }
    (tensor, letterbox)
}

/// Locate score/bbox/kps tensors per stride.
///
/// Exports either name them `score_8`, `bbox_16`, ... or use opaque
/// numeric names in the canonical order: scores, then bboxes, then kps.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: u32| names.iter().position(|n| *n == format!("{prefix}_{stride}"));
    let by_name: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| {
            Some(StrideOutputs {
                score: find("score", s)?,
                bbox: find("bbox", s)?,
                kps: find("kps", s)?,
            })
        })
        .collect();

    match by_name {
        Some(v) => [v[0], v[1], v[2]],
        None => std::array::from_fn(|i| StrideOutputs { score: i, bbox: i + 3, kps: i + 6 }),
    }
}

/// Decode one stride's anchors into source-space boxes above `threshold`.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: u32,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = (SCRFD_INPUT_SIZE / stride) as usize;
    let step = stride as f32;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;

    (0..anchors.min(scores.len()))
        .filter(|&i| scores[i] > threshold)
        .filter_map(|i| {
            let cell = i / SCRFD_ANCHORS_PER_CELL;
            let (ax, ay) = ((cell % grid) as f32 * step, (cell / grid) as f32 * step);

            let d = bboxes.get(i * 4..i * 4 + 4)?;
            let (x1, y1) = letterbox.to_source((ax - d[0] * step, ay - d[1] * step));
            let (x2, y2) = letterbox.to_source((ax + d[2] * step, ay + d[3] * step));

            let landmarks = kps.get(i * 10..i * 10 + 10).map(|k| {
                std::array::from_fn(|p| letterbox.to_source((ax + k[2 * p] * step, ay + k[2 * p + 1] * step)))
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: scores[i],
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by confidence, descending.
fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection-over-Union between two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = w * h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}
