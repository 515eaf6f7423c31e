//! Strategy interfaces for the two model capabilities.
//!
//! The pipeline only ever talks to these traits, so a different model
//! family can be dropped in without touching stage logic. Implementations
//! may hold mutable inference state (ONNX sessions), hence `&mut self`.

use crate::types::{Embedding, FaceCrop};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CapabilityError {
    /// Worth retrying: resource exhaustion, a busy runtime, a timeout.
    #[error("transient capability failure: {0}")]
    Transient(String),
    /// Retrying the same input will fail the same way.
    #[error("capability failure: {0}")]
    Fatal(String),
}

impl CapabilityError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CapabilityError::Transient(_))
    }
}

/// Locates at most one face in an image.
pub trait FaceDetector: Send {
    /// Returns the best face crop, or `None` when the image has no face.
    fn detect(&mut self, image: &RgbImage) -> Result<Option<FaceCrop>, CapabilityError>;
}

/// Maps a face crop to a fixed-length embedding.
pub trait FaceEmbedder: Send {
    /// Returns `None` when the crop is too degenerate to embed.
    fn embed(&mut self, crop: &RgbImage) -> Result<Option<Embedding>, CapabilityError>;

    /// Dimensionality of produced embeddings, when fixed by the model.
    fn dimension(&self) -> Option<usize> {
        None
    }
}

impl<T: FaceDetector + ?Sized> FaceDetector for Box<T> {
    fn detect(&mut self, image: &RgbImage) -> Result<Option<FaceCrop>, CapabilityError> {
        (**self).detect(image)
    }
}

impl<T: FaceEmbedder + ?Sized> FaceEmbedder for Box<T> {
    fn embed(&mut self, crop: &RgbImage) -> Result<Option<Embedding>, CapabilityError> {
        (**self).embed(crop)
    }

    fn dimension(&self) -> Option<usize> {
        (**self).dimension()
    }
}
