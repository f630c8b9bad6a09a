use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use warden_core::calibrate::validate_threshold;
use warden_core::crop::CropConfigError;
use warden_core::provider::{DETECTOR_MODEL_FILE, EMBEDDER_MODEL_FILE};
use warden_core::{CalibrationError, CropConfig, ThresholdConfig};

const DEFAULT_BIND: &str = "0.0.0.0:1111";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("WARDEN_THRESHOLD: {0}")]
    Threshold(#[source] CalibrationError),
    #[error("WARDEN_CROP_SIZE / WARDEN_CROP_MARGIN: {0}")]
    Crop(#[from] CropConfigError),
}

/// Daemon configuration, loaded once from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address.
    pub bind: SocketAddr,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Template snapshot produced by `warden enroll`.
    pub db_path: PathBuf,
    /// Decision threshold used when no threshold file is given.
    pub threshold: f32,
    /// Calibrated threshold written by `warden calibrate --out`; wins over `threshold`.
    pub threshold_file: Option<PathBuf>,
    pub cooldown: Duration,
    pub evidence_dir: PathBuf,
    pub crop: CropConfig,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    pub max_upload_bytes: usize,
    /// V4L2 device for the headless capture loop. Unset disables the loop.
    pub camera_device: Option<String>,
    pub camera_width: u32,
    pub camera_height: u32,
}

impl Config {
    /// Load configuration from `WARDEN_*` environment variables with defaults.
    ///
    /// Unparseable values fall back to their default; parsed values outside
    /// their valid range are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let parsed = |key: &str| Parsed(lookup(key));
        let crop_defaults = CropConfig::default();

        let bind = parsed("WARDEN_BIND").get().unwrap_or_else(|| {
            if let Some(v) = lookup("WARDEN_BIND") {
                tracing::warn!(value = %v, default = DEFAULT_BIND, "invalid WARDEN_BIND, using default");
            }
            SocketAddr::from(([0, 0, 0, 0], 1111))
        });

        let config = Self {
            bind,
            model_dir: lookup("WARDEN_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(warden_core::default_model_dir),
            db_path: lookup("WARDEN_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("server_admins.wdb")),
            threshold: parsed("WARDEN_THRESHOLD").get().unwrap_or(warden_core::DEFAULT_THRESHOLD),
            threshold_file: lookup("WARDEN_THRESHOLD_FILE").filter(|v| !v.is_empty()).map(PathBuf::from),
            cooldown: Duration::from_secs(parsed("WARDEN_COOLDOWN_SECS").get().unwrap_or(5)),
            evidence_dir: lookup("WARDEN_EVIDENCE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("intruder")),
            crop: CropConfig {
                margin: parsed("WARDEN_CROP_MARGIN").get().unwrap_or(crop_defaults.margin),
                size: parsed("WARDEN_CROP_SIZE").get().unwrap_or(crop_defaults.size),
            },
            intra_threads: parsed("WARDEN_INTRA_THREADS").get().unwrap_or(2),
            max_upload_bytes: parsed("WARDEN_MAX_UPLOAD_BYTES").get().unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            camera_device: lookup("WARDEN_CAMERA_DEVICE").filter(|v| !v.is_empty()),
            camera_width: parsed("WARDEN_CAMERA_WIDTH").get().unwrap_or(640),
            camera_height: parsed("WARDEN_CAMERA_HEIGHT").get().unwrap_or(480),
        };
        validate_threshold(config.threshold).map_err(ConfigError::Threshold)?;
        config.crop.validate()?;
        Ok(config)
    }

    /// Threshold from the calibration file if configured, else `threshold`.
    pub fn effective_threshold(&self) -> Result<f32, CalibrationError> {
        match &self.threshold_file {
            Some(path) => {
                let cfg = ThresholdConfig::load(path)?;
                tracing::info!(
                    path = %path.display(),
                    threshold = cfg.value,
                    percentile = cfg.percentile,
                    margin = cfg.margin,
                    "using calibrated threshold"
                );
                Ok(cfg.value)
            }
            None => Ok(self.threshold),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir.join(DETECTOR_MODEL_FILE).to_string_lossy().into_owned()
    }

    /// Path to the FaceNet embedding model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir.join(EMBEDDER_MODEL_FILE).to_string_lossy().into_owned()
    }
}

/// A raw variable value, parsed on demand into whatever type the field needs.
struct Parsed(Option<String>);

impl Parsed {
    fn get<T: FromStr>(self) -> Option<T> {
        self.0.and_then(|v| v.trim().parse().ok())
    }
}
