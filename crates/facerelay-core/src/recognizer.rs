//! ArcFace face embedder via ONNX Runtime.
//!
//! Produces L2-normalized 512-dimensional embeddings from face crops using
//! the w600k_r50 ArcFace model.

use crate::capability::{CapabilityError, FaceEmbedder};
use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric normalization, not SCRFD's 128.0
const ARCFACE_EMBEDDING_DIM: usize = 512;

/// Crops with a shorter side below this carry too little signal to embed.
pub const MIN_CROP_SIDE: u32 = 16;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}; download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<RecognizerError> for CapabilityError {
    fn from(err: RecognizerError) -> Self {
        match err {
            RecognizerError::Ort(e) => CapabilityError::Transient(e.to_string()),
            other => CapabilityError::Fatal(other.to_string()),
        }
    }
}

/// ArcFace-based implementation of [`FaceEmbedder`].
pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    fn infer(&mut self, crop: &RgbImage) -> Result<Vec<f32>, RecognizerError> {
        let input = preprocess(crop);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        Ok(raw.to_vec())
    }
}

impl FaceEmbedder for ArcFaceEmbedder {
    fn embed(&mut self, crop: &RgbImage) -> Result<Option<Embedding>, CapabilityError> {
        if crop.width().min(crop.height()) < MIN_CROP_SIDE {
            tracing::debug!(width = crop.width(), height = crop.height(), "crop too small to embed");
            return Ok(None);
        }
        let raw = self.infer(crop)?;
        Ok(l2_normalize(raw).map(Embedding::new))
    }

    fn dimension(&self) -> Option<usize> {
        Some(ARCFACE_EMBEDDING_DIM)
    }
}

/// Scale to unit length. `None` for a zero or non-finite vector.
pub fn l2_normalize(mut values: Vec<f32>) -> Option<Vec<f32>> {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if !norm.is_finite() || norm == 0.0 {
        return None;
    }
    values.iter_mut().for_each(|x| *x /= norm);
    Some(values)
}

/// Resize a crop to 112×112 and lay it out as a normalized NCHW tensor.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE;
    let resized = if crop.dimensions() == (size, size) {
        crop.clone()
    } else {
        imageops::resize(crop, size, size, FilterType::Triangle)
    };

    let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
    for (x, y, px) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}
