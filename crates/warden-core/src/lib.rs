//! warden-core: Identity verification and intrusion alerting engine.
//!
//! Uses SCRFD for face detection and FaceNet (VGGFace2) for embeddings,
//! both running via ONNX Runtime for CPU inference. Enrolled identities are
//! averaged into unit-norm templates; live faces are matched by cosine
//! distance with a calibrated rejection threshold, and strangers trigger
//! cooldown-gated evidence writes.

pub mod alert;
pub mod calibrate;
pub mod crop;
pub mod detector;
pub mod enroll;
pub mod matcher;
pub mod provider;
pub mod recognizer;
pub mod templates;
pub mod types;
pub mod watch;

pub use alert::{AlertController, AlertError, AlertEvent, Evidence};
pub use calibrate::{calibrate, Calibration, CalibrationError, CalibrationParams, ThresholdConfig};
pub use crop::CropConfig;
pub use enroll::{EnrollError, EnrollWarning, Enrollment};
pub use matcher::{recognize, CosineMatcher, Matcher};
pub use provider::{FaceFeatureProvider, FaceFeatures, FeatureError, OnnxFeatureProvider};
pub use templates::{EnrolledIdentity, TemplateDatabase, TemplateError};
pub use types::{BoundingBox, Embedding, MatchResult};
pub use watch::{CaptureError, CaptureLoop, FrameSink, FrameSource, LoopState, LoopSummary};

use std::path::PathBuf;

/// Default decision threshold when no calibration file is supplied.
pub const DEFAULT_THRESHOLD: f32 = 0.429;

const SYSTEM_MODEL_DIR: &str = "/usr/share/warden/models";

/// Model directory: `WARDEN_MODEL_DIR` if set, else the system location.
pub fn default_model_dir() -> PathBuf {
    std::env::var_os("WARDEN_MODEL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(SYSTEM_MODEL_DIR))
}
