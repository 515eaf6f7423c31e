use facerelay_core::detector::DetectorConfig;
use facerelay_core::Metric;
use std::path::PathBuf;
use std::time::Duration;

/// Which message bus the detection daemon serves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    Session,
    System,
}

/// Settings shared by both daemons.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    /// SQLite file holding the work and response queues.
    pub queue_db: PathBuf,
    pub work_queue: String,
    pub response_queue: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Upper bound on a single detection or embedding call.
    pub capability_timeout: Duration,
    /// Emit an `Error` result for malformed input instead of dropping it.
    pub report_malformed: bool,
}

/// Detection daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct DetectConfig {
    pub shared: SharedConfig,
    pub bus: Bus,
    pub confidence_threshold: f32,
    pub min_face_size: f32,
    pub crop_size: u32,
    pub dedup_capacity: usize,
    /// `None` keeps ids until capacity evicts them.
    pub dedup_ttl: Option<Duration>,
}

/// Recognition daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct RecognizeConfig {
    pub shared: SharedConfig,
    /// Reference database file. Required.
    pub reference_db: Option<PathBuf>,
    pub metric: Metric,
    pub max_distance: Option<f32>,
    pub batch_size: usize,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
}

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

impl SharedConfig {
    /// Load the settings common to every facerelay process.
    pub fn from_env() -> Self {
        Self::from_lookup(&process_env)
    }

    fn from_lookup(var: Lookup<'_>) -> Self {
        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facerelay");

        Self {
            queue_db: var("FACERELAY_QUEUE_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("queues.db")),
            work_queue: var("FACERELAY_WORK_QUEUE").unwrap_or_else(|| "face-requests".to_string()),
            response_queue: var("FACERELAY_RESPONSE_QUEUE").unwrap_or_else(|| "face-responses".to_string()),
            model_dir: var("FACERELAY_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("models")),
            capability_timeout: Duration::from_secs(env_u64(var, "FACERELAY_CAPABILITY_TIMEOUT_SECS", 10).max(1)),
            report_malformed: env_flag(var, "FACERELAY_REPORT_MALFORMED", true),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir.join("det_10g.onnx").to_string_lossy().into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir.join("w600k_r50.onnx").to_string_lossy().into_owned()
    }
}

impl DetectConfig {
    /// Load configuration from `FACERELAY_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(&process_env)
    }

    fn from_lookup(var: Lookup<'_>) -> Self {
        let defaults = DetectorConfig::default();
        let ttl_secs = env_u64(var, "FACERELAY_DEDUP_TTL_SECS", 86_400);
        Self {
            shared: SharedConfig::from_lookup(var),
            bus: match var("FACERELAY_BUS").as_deref() {
                Some("system") => Bus::System,
                _ => Bus::Session,
            },
            confidence_threshold: env_f32(var, "FACERELAY_CONFIDENCE_THRESHOLD", defaults.confidence_threshold),
            min_face_size: env_f32(var, "FACERELAY_MIN_FACE_SIZE", defaults.min_face_size),
            crop_size: env_u64(var, "FACERELAY_CROP_SIZE", u64::from(defaults.crop_size))
                .clamp(1, u64::from(u32::MAX)) as u32,
            dedup_capacity: env_usize(var, "FACERELAY_DEDUP_CAPACITY", 100_000).max(1),
            dedup_ttl: (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)),
        }
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            confidence_threshold: self.confidence_threshold,
            min_face_size: self.min_face_size,
            crop_size: self.crop_size,
            ..DetectorConfig::default()
        }
    }
}

impl RecognizeConfig {
    /// Load configuration from `FACERELAY_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(&process_env)
    }

    fn from_lookup(var: Lookup<'_>) -> Self {
        let metric = match var("FACERELAY_METRIC") {
            Some(raw) => raw.parse().unwrap_or_else(|err| {
                tracing::warn!(value = %raw, error = %err, "unknown metric; using euclidean");
                Metric::Euclidean
            }),
            None => Metric::Euclidean,
        };
        Self {
            shared: SharedConfig::from_lookup(var),
            reference_db: var("FACERELAY_REFERENCE_DB").filter(|p| !p.is_empty()).map(PathBuf::from),
            metric,
            max_distance: var("FACERELAY_MAX_DISTANCE")
                .and_then(|v| v.parse::<f32>().ok())
                .filter(|d| d.is_finite() && *d >= 0.0),
            batch_size: env_usize(var, "FACERELAY_BATCH_SIZE", 10).max(1),
            visibility_timeout: Duration::from_secs(env_u64(var, "FACERELAY_VISIBILITY_TIMEOUT_SECS", 30)),
            poll_interval: Duration::from_millis(env_u64(var, "FACERELAY_POLL_INTERVAL_MS", 500)),
        }
    }
}

fn env_f32(var: Lookup<'_>, key: &str, default: f32) -> f32 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(var: Lookup<'_>, key: &str, default: u64) -> u64 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(var: Lookup<'_>, key: &str, default: usize) -> usize {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_flag(var: Lookup<'_>, key: &str, default: bool) -> bool {
    var(key).map(|v| v != "0").unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_detect_defaults() {
        let var = lookup(&[("HOME", "/home/ops")]);
        let cfg = DetectConfig::from_lookup(&var);
        assert_eq!(cfg.shared.queue_db, PathBuf::from("/home/ops/.local/share/facerelay/queues.db"));
        assert_eq!(cfg.shared.work_queue, "face-requests");
        assert_eq!(cfg.shared.response_queue, "face-responses");
        assert_eq!(cfg.shared.capability_timeout, Duration::from_secs(10));
        assert!(cfg.shared.report_malformed);
        assert_eq!(cfg.bus, Bus::Session);
        assert_eq!(cfg.crop_size, 240);
        assert_eq!(cfg.min_face_size, 20.0);
        assert_eq!(cfg.dedup_capacity, 100_000);
        assert_eq!(cfg.dedup_ttl, Some(Duration::from_secs(86_400)));
    }

    #[test]
    fn test_detect_overrides() {
        let var = lookup(&[
            ("XDG_DATA_HOME", "/var/lib"),
            ("FACERELAY_BUS", "system"),
            ("FACERELAY_DEDUP_TTL_SECS", "0"),
            ("FACERELAY_CROP_SIZE", "160"),
            ("FACERELAY_REPORT_MALFORMED", "0"),
            ("FACERELAY_CONFIDENCE_THRESHOLD", "not-a-number"),
        ]);
        let cfg = DetectConfig::from_lookup(&var);
        assert_eq!(cfg.shared.model_dir, PathBuf::from("/var/lib/facerelay/models"));
        assert_eq!(cfg.bus, Bus::System);
        assert_eq!(cfg.dedup_ttl, None);
        assert_eq!(cfg.detector_config().crop_size, 160);
        assert!(!cfg.shared.report_malformed);
        assert_eq!(cfg.confidence_threshold, 0.5);
    }

    #[test]
    fn test_recognize_settings() {
        let var = lookup(&[
            ("HOME", "/root"),
            ("FACERELAY_REFERENCE_DB", "/srv/refs.json"),
            ("FACERELAY_METRIC", "cosine"),
            ("FACERELAY_MAX_DISTANCE", "0.6"),
            ("FACERELAY_BATCH_SIZE", "0"),
        ]);
        let cfg = RecognizeConfig::from_lookup(&var);
        assert_eq!(cfg.reference_db, Some(PathBuf::from("/srv/refs.json")));
        assert_eq!(cfg.metric, Metric::Cosine);
        assert_eq!(cfg.max_distance, Some(0.6));
        assert_eq!(cfg.batch_size, 1);
        assert_eq!(cfg.visibility_timeout, Duration::from_secs(30));
        assert_eq!(cfg.poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_recognize_requires_reference_db() {
        let var = lookup(&[("HOME", "/root"), ("FACERELAY_MAX_DISTANCE", "-1")]);
        let cfg = RecognizeConfig::from_lookup(&var);
        assert_eq!(cfg.reference_db, None);
        assert_eq!(cfg.max_distance, None);
        assert_eq!(cfg.metric, Metric::Euclidean);
    }
}
