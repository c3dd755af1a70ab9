use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Listen address for the HTTP/WebSocket surface.
    pub bind_addr: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Upper bound on one frame's processing time, in seconds.
    pub frame_timeout_secs: u64,
    /// Whether processed frames are returned with boxes burned in.
    pub annotate_frames: bool,
    /// Access log retention window, in days.
    pub retention_days: i64,
    /// Seconds between retention sweeps.
    pub sweep_interval_secs: u64,
}

impl Config {
    /// Load configuration from `WARDEN_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("warden");

        let model_dir = std::env::var("WARDEN_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let db_path = std::env::var("WARDEN_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("warden.db"));

        Self {
            bind_addr: std::env::var("WARDEN_BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8787".to_string()),
            model_dir,
            db_path,
            similarity_threshold: env_f32("WARDEN_SIMILARITY_THRESHOLD", 0.50),
            frame_timeout_secs: env_u64("WARDEN_FRAME_TIMEOUT_SECS", 10),
            annotate_frames: std::env::var("WARDEN_ANNOTATE_FRAMES")
                .map(|v| flag_enabled(&v))
                .unwrap_or(true),
            retention_days: env_i64("WARDEN_LOG_RETENTION_DAYS", 7),
            sweep_interval_secs: env_u64("WARDEN_SWEEP_INTERVAL_SECS", 86_400),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

/// "0", "false" and "off" (any case) disable a flag; everything else
/// enables it.
fn flag_enabled(value: &str) -> bool {
    !matches!(value.to_ascii_lowercase().as_str(), "0" | "false" | "off")
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

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_disabled_spellings() {
        for v in ["0", "false", "FALSE", "off", "Off"] {
            assert!(!flag_enabled(v), "{v:?} should disable");
        }
    }

    #[test]
    fn test_flag_enabled_spellings() {
        for v in ["1", "true", "on", "yes", ""] {
            assert!(flag_enabled(v), "{v:?} should enable");
        }
    }
}
