use rollcall_core::pipeline::{DEFAULT_MATCH_THRESHOLD, DEFAULT_MAX_FACES};
use rollcall_core::strategy::{self, DetectionStrategy};
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Euclidean distance below which a face matches an enrolled identity.
    /// The reference deployment used 0.6 (with a stray 0.67 in a duplicate
    /// code path); 0.6 is the deliberate default.
    pub match_threshold: f32,
    /// Cap on faces processed per frame.
    pub max_faces: usize,
    /// Timeout in seconds for one recognize request.
    pub recognize_timeout_secs: u64,
    /// Detection strategies tried in order per frame.
    pub strategies: Vec<DetectionStrategy>,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/usr/share/rollcall/models"));

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let strategies = match std::env::var("ROLLCALL_DETECTION_LADDER") {
            Ok(raw) => match strategy::parse_ladder(&raw) {
                Ok(ladder) if !ladder.is_empty() => ladder,
                Ok(_) => DetectionStrategy::default_ladder(),
                Err(err) => {
                    tracing::warn!(error = %err, "bad ROLLCALL_DETECTION_LADDER, using default");
                    DetectionStrategy::default_ladder()
                }
            },
            Err(_) => DetectionStrategy::default_ladder(),
        };

        Self {
            db_path,
            model_dir,
            match_threshold: env_f32("ROLLCALL_MATCH_THRESHOLD", DEFAULT_MATCH_THRESHOLD),
            max_faces: env_usize("ROLLCALL_MAX_FACES", DEFAULT_MAX_FACES),
            recognize_timeout_secs: env_u64("ROLLCALL_RECOGNIZE_TIMEOUT_SECS", 10),
            strategies,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
