//! facerelayd: the two pipeline stages and the plumbing they share.
//!
//! The detection stage is fed over D-Bus and publishes to SQLite-backed
//! queues; the recognition stage polls the work queue in batches. Model
//! inference runs on dedicated engine threads loaded once at startup.

pub mod config;
pub mod dbus_interface;
pub mod dedup;
pub mod detection;
pub mod engine;
pub mod error;
pub mod recognition;
pub mod stats;

pub use dedup::SeenSet;
pub use detection::{DetectionSettings, DetectionStage, Routed};
pub use engine::{spawn_detector, spawn_embedder, DetectorEngine, EmbedderEngine, EngineError};
pub use error::StageError;
pub use recognition::{BatchReport, ItemOutcome, RecognitionSettings, RecognitionStage};
pub use stats::StatsSnapshot;
