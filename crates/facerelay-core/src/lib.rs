//! facerelay-core: Face detection, embedding and identity matching.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings, both
//! running via ONNX Runtime for CPU inference. Matching is a linear
//! nearest-neighbor scan over a read-only reference database.

pub mod alignment;
pub mod capability;
pub mod detector;
pub mod frame;
pub mod matcher;
pub mod recognizer;
pub mod reference;
pub mod types;

pub use capability::{CapabilityError, FaceDetector, FaceEmbedder};
pub use detector::ScrfdDetector;
pub use matcher::{Match, MatchError, Matcher, Metric, NearestNeighborMatcher};
pub use recognizer::ArcFaceEmbedder;
pub use reference::{ReferenceDatabase, ReferenceError};
pub use types::{BoundingBox, Embedding, FaceCrop};

