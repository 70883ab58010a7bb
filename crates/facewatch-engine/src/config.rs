use facewatch_core::{DetectorChoice, DetectorConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Gap between the match tolerance and the secondary distance ceiling.
const DISTANCE_MARGIN: f32 = 0.05;
/// Longest accepted event cooldown, unknown multiplier included (one week).
const MAX_COOLDOWN_SECS: f32 = 7.0 * 24.0 * 3600.0;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unknown preset {0:?} (expected fast, balanced or cctv)")]
    UnknownPreset(String),
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: String },
}

/// Named tuning bundles for common deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// Webcam at arm's length.
    Fast,
    Balanced,
    /// Small, distant faces.
    Cctv,
}

impl FromStr for Preset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(Preset::Fast),
            "balanced" => Ok(Preset::Balanced),
            "cctv" => Ok(Preset::Cctv),
            other => Err(ConfigError::UnknownPreset(other.to_string())),
        }
    }
}

/// Everything a recognition session needs, passed by value into `start()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub camera_index: u32,
    pub detector: DetectorChoice,
    /// Maximum distance for a match.
    pub tolerance: f32,
    /// Secondary distance ceiling; the effective bound is `min(tolerance, distance_threshold)`.
    pub distance_threshold: f32,
    /// Upsample level 0–2 for the classic detector.
    pub upsample: u32,
    /// Downscale factor applied before detection.
    pub frame_scale: f32,
    pub process_every_n_frames: u32,
    pub show_confidence: bool,
    /// Interpolation factor α for displayed boxes.
    pub smoothing_factor: f32,
    pub log_cooldown_secs: f32,
    pub unknown_cooldown_multiplier: f32,
    pub frame_queue_capacity: usize,
    pub camera_open_timeout_ms: u64,
    pub model_dir: PathBuf,
    pub db_path: PathBuf,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            camera_index: 0,
            detector: DetectorChoice::Auto,
            tolerance: 0.45,
            distance_threshold: 0.50,
            upsample: 1,
            frame_scale: 0.25,
            process_every_n_frames: 3,
            show_confidence: true,
            smoothing_factor: 0.3,
            log_cooldown_secs: 5.0,
            unknown_cooldown_multiplier: 2.0,
            frame_queue_capacity: 2,
            camera_open_timeout_ms: 3000,
            model_dir: data_dir().join("models"),
            db_path: data_dir().join("faces.db"),
        }
    }
}

impl PipelineSettings {
    /// Resolve settings in layers: defaults, optional TOML file, optional
    /// preset, then `FACEWATCH_*` environment variables.
    pub fn load(path: Option<&Path>, preset: Option<Preset>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };
        if let Some(preset) = preset {
            settings.apply_preset(preset);
        }
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_toml_str(&raw)?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(settings)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Set the tolerance and derive the secondary ceiling from it.
    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.set_tolerance(tolerance);
        self
    }

    fn set_tolerance(&mut self, tolerance: f32) {
        self.tolerance = tolerance;
        self.distance_threshold = tolerance + DISTANCE_MARGIN;
    }

    pub fn apply_preset(&mut self, preset: Preset) {
        let (tolerance, upsample, frame_scale) = match preset {
            Preset::Fast => (0.45, 0, 0.25),
            Preset::Balanced => (0.40, 1, 0.25),
            Preset::Cctv => (0.35, 2, 0.5),
        };
        self.set_tolerance(tolerance);
        self.upsample = upsample;
        self.frame_scale = frame_scale;
        tracing::info!(?preset, tolerance, upsample, frame_scale, "applied preset");
    }

    /// Override fields from `FACEWATCH_*` variables; unparsable values are ignored.
    pub fn apply_env(&mut self) {
        self.camera_index = env_parse("FACEWATCH_CAMERA_INDEX", self.camera_index);
        self.detector = env_parse("FACEWATCH_DETECTOR", self.detector);
        if let Some(tolerance) = env_opt::<f32>("FACEWATCH_TOLERANCE") {
            self.set_tolerance(tolerance);
        }
        self.distance_threshold = env_parse("FACEWATCH_DISTANCE_THRESHOLD", self.distance_threshold);
        self.upsample = env_parse("FACEWATCH_UPSAMPLE", self.upsample);
        self.frame_scale = env_parse("FACEWATCH_FRAME_SCALE", self.frame_scale);
        self.process_every_n_frames =
            env_parse("FACEWATCH_PROCESS_EVERY_N_FRAMES", self.process_every_n_frames);
        self.show_confidence = std::env::var("FACEWATCH_SHOW_CONFIDENCE")
            .map(|v| v != "0")
            .unwrap_or(self.show_confidence);
        self.smoothing_factor = env_parse("FACEWATCH_SMOOTHING_FACTOR", self.smoothing_factor);
        self.log_cooldown_secs = env_parse("FACEWATCH_LOG_COOLDOWN_SECS", self.log_cooldown_secs);
        if let Ok(dir) = std::env::var("FACEWATCH_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("FACEWATCH_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn out_of_range(field: &'static str, value: impl ToString) -> ConfigError {
            ConfigError::OutOfRange {
                field,
                value: value.to_string(),
            }
        }

        if !(self.smoothing_factor > 0.0 && self.smoothing_factor <= 1.0) {
            return Err(out_of_range("smoothing_factor", self.smoothing_factor));
        }
        if self.process_every_n_frames == 0 {
            return Err(out_of_range("process_every_n_frames", 0));
        }
        if !(self.frame_scale > 0.0 && self.frame_scale <= 1.0) {
            return Err(out_of_range("frame_scale", self.frame_scale));
        }
        if !(1..=2).contains(&self.frame_queue_capacity) {
            return Err(out_of_range("frame_queue_capacity", self.frame_queue_capacity));
        }
        if self.upsample > 2 {
            return Err(out_of_range("upsample", self.upsample));
        }
        // NaN fails every comparison, so these are written to reject it.
        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            return Err(out_of_range("tolerance", self.tolerance));
        }
        if !(self.distance_threshold.is_finite() && self.distance_threshold >= 0.0) {
            return Err(out_of_range("distance_threshold", self.distance_threshold));
        }
        if !(self.log_cooldown_secs >= 0.0 && self.log_cooldown_secs <= MAX_COOLDOWN_SECS) {
            return Err(out_of_range("log_cooldown_secs", self.log_cooldown_secs));
        }
        if !(self.unknown_cooldown_multiplier >= 1.0
            && self.log_cooldown_secs * self.unknown_cooldown_multiplier <= MAX_COOLDOWN_SECS)
        {
            return Err(out_of_range(
                "unknown_cooldown_multiplier",
                self.unknown_cooldown_multiplier,
            ));
        }
        Ok(())
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            model_dir: self.model_dir.clone(),
            upsample: self.upsample,
        }
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn log_cooldown(&self) -> Duration {
        Duration::try_from_secs_f32(self.log_cooldown_secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    pub fn camera_open_timeout(&self) -> Duration {
        Duration::from_millis(self.camera_open_timeout_ms)
    }
}

/// `$XDG_DATA_HOME/facewatch`, falling back to `~/.local/share/facewatch`.
fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facewatch")
}

fn env_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_opt(key).unwrap_or(default)
}
