//! Threshold calibration from cross-identity template distances.
//!
//! Every unordered pair of distinct identities contributes one cosine
//! distance. A low percentile of that distribution, minus a safety margin,
//! becomes the decision threshold. This is a heuristic bound only.

use crate::templates::TemplateDatabase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_PERCENTILE: f32 = 5.0;
pub const DEFAULT_MARGIN: f32 = 0.03;

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("calibration needs at least 2 identities, database has {0}")]
    InsufficientIdentities(usize),
    #[error("percentile must be within [0, 100], got {0}")]
    InvalidPercentile(f32),
    #[error("margin must be finite and non-negative, got {0}")]
    InvalidMargin(f32),
    #[error("threshold must be a cosine distance within [0, 2], got {0}")]
    InvalidThreshold(f32),
    #[error("threshold file {path}: {reason}")]
    ThresholdFile { path: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationParams {
    pub percentile: f32,
    pub margin: f32,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            percentile: DEFAULT_PERCENTILE,
            margin: DEFAULT_MARGIN,
        }
    }
}

/// Accept `value` only as a usable decision threshold. NaN is rejected.
pub fn validate_threshold(value: f32) -> Result<f32, CalibrationError> {
    if (0.0..=2.0).contains(&value) {
        Ok(value)
    } else {
        Err(CalibrationError::InvalidThreshold(value))
    }
}

/// Decision threshold plus the parameters that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Maximum cosine distance still accepted as a match, in [0, 2].
    pub value: f32,
    pub percentile: f32,
    pub margin: f32,
    pub computed_at: DateTime<Utc>,
}

impl ThresholdConfig {
    pub fn save(&self, path: &Path) -> Result<(), CalibrationError> {
        let file_err = |reason: String| CalibrationError::ThresholdFile {
            path: path.display().to_string(),
            reason,
        };
        let text = toml::to_string_pretty(self).map_err(|e| file_err(e.to_string()))?;
        fs::write(path, text).map_err(|e| file_err(e.to_string()))
    }

    /// Read a threshold file and check the value lies in [0, 2].
    pub fn load(path: &Path) -> Result<Self, CalibrationError> {
        let file_err = |reason: String| CalibrationError::ThresholdFile {
            path: path.display().to_string(),
            reason,
        };
        let text = fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;
        let config: ThresholdConfig = toml::from_str(&text).map_err(|e| file_err(e.to_string()))?;
        validate_threshold(config.value).map_err(|e| file_err(e.to_string()))?;
        Ok(config)
    }
}

/// Summary of the cross-identity distance distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DistanceStats {
    pub pairs: usize,
    pub min: f32,
    pub mean: f32,
    pub max: f32,
    pub percentile_value: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Calibration {
    pub threshold: ThresholdConfig,
    pub stats: DistanceStats,
}

/// Cosine distances for all C(N, 2) pairs `(i, j)`, `i < j`, in that order.
pub fn pairwise_distances(db: &TemplateDatabase) -> Vec<f32> {
    let ids = db.identities();
    let mut out = Vec::with_capacity(ids.len() * ids.len().saturating_sub(1) / 2);
    for (i, a) in ids.iter().enumerate() {
        for b in &ids[i + 1..] {
            out.push(a.template.cosine_distance(&b.template));
        }
    }
    out
}

/// Lower nearest-rank percentile of ascending-sorted values:
/// the element at index ⌊p/100 · (n − 1)⌋.
///
/// Always returns an observed distance. NumPy's default linear
/// interpolation would land between the two neighbouring ranks instead, so
/// for larger pair counts this can sit slightly below it.
pub fn percentile_lower(sorted: &[f32], percentile: f32) -> Option<f32> {
    let last = sorted.len().checked_sub(1)?;
    let idx = ((percentile / 100.0) * last as f32).floor() as usize;
    sorted.get(idx.min(last)).copied()
}

pub fn calibrate(db: &TemplateDatabase, params: CalibrationParams) -> Result<Calibration, CalibrationError> {
    if !(0.0..=100.0).contains(&params.percentile) {
        return Err(CalibrationError::InvalidPercentile(params.percentile));
    }
    if !params.margin.is_finite() || params.margin < 0.0 {
        return Err(CalibrationError::InvalidMargin(params.margin));
    }
    if db.len() < 2 {
        return Err(CalibrationError::InsufficientIdentities(db.len()));
    }

    let mut dists = pairwise_distances(db);
    dists.sort_by(f32::total_cmp);

    let pairs = dists.len();
    let min = dists[0];
    let max = dists[pairs - 1];
    let mean = dists.iter().sum::<f32>() / pairs as f32;
    let percentile_value =
        percentile_lower(&dists, params.percentile).ok_or(CalibrationError::InsufficientIdentities(db.len()))?;

    let value = (percentile_value - params.margin).clamp(0.0, 2.0);

    tracing::info!(
        identities = db.len(),
        pairs,
        min,
        mean,
        max,
        percentile_value,
        threshold = value,
        "calibration complete"
    );

    Ok(Calibration {
        threshold: ThresholdConfig {
            value,
            percentile: params.percentile,
            margin: params.margin,
            computed_at: Utc::now(),
        },
        stats: DistanceStats {
            pairs,
            min,
            mean,
            max,
            percentile_value,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::EnrolledIdentity;
    use crate::types::Embedding;
    use rand::Rng;

    fn db_from(vectors: Vec<Vec<f32>>) -> TemplateDatabase {
        let identities = vectors
            .into_iter()
            .enumerate()
            .map(|(i, v)| EnrolledIdentity {
                label: format!("id{i}"),
                template: Embedding::new(v).normalized(),
                sample_count: 1,
            })
            .collect();
        TemplateDatabase::new(identities).unwrap()
    }

    /// Unit vectors with pairwise cosine distances d(A,B)=0.50, d(A,C)=0.55, d(B,C)=0.60.
    fn abc() -> Vec<Vec<f32>> {
        let b2 = (1.0f32 - 0.25).sqrt();
        let c2 = (0.4 - 0.45 * 0.5) / b2;
        let c3 = (1.0 - 0.45f32 * 0.45 - c2 * c2).sqrt();
        vec![vec![1.0, 0.0, 0.0], vec![0.5, b2, 0.0], vec![0.45, c2, c3]]
    }

    #[test]
    fn test_scenario_three_identities() {
        let db = db_from(abc());
        let cal = calibrate(&db, CalibrationParams::default()).unwrap();

        assert_eq!(cal.stats.pairs, 3);
        assert!((cal.stats.min - 0.50).abs() < 1e-4);
        assert!((cal.stats.max - 0.60).abs() < 1e-4);
        assert!((cal.stats.mean - 0.55).abs() < 1e-4);
        assert!((cal.stats.percentile_value - 0.50).abs() < 1e-4);
        assert!((cal.threshold.value - 0.47).abs() < 1e-4);
        assert_eq!(cal.threshold.percentile, 5.0);
        assert_eq!(cal.threshold.margin, 0.03);
    }

    #[test]
    fn test_pair_count_is_n_choose_2() {
        let mut rng = rand::thread_rng();
        for n in 2..12usize {
            let vectors = (0..n)
                .map(|_| (0..16).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
                .collect();
            let db = db_from(vectors);
            assert_eq!(pairwise_distances(&db).len(), n * (n - 1) / 2);
            assert_eq!(calibrate(&db, CalibrationParams::default()).unwrap().stats.pairs, n * (n - 1) / 2);
        }
    }

    #[test]
    fn test_insufficient_identities() {
        let db = db_from(vec![vec![1.0, 0.0]]);
        let err = calibrate(&db, CalibrationParams::default()).unwrap_err();
        assert!(matches!(err, CalibrationError::InsufficientIdentities(1)));
    }

    #[test]
    fn test_threshold_clamped_at_zero() {
        let db = db_from(vec![vec![1.0, 0.0], vec![1.0, 0.01]]);
        let params = CalibrationParams { percentile: 5.0, margin: 0.5 };
        assert_eq!(calibrate(&db, params).unwrap().threshold.value, 0.0);
    }

    #[test]
    fn test_rejects_bad_params() {
        let db = db_from(abc());
        let bad_p = CalibrationParams { percentile: 101.0, margin: 0.03 };
        assert!(matches!(calibrate(&db, bad_p), Err(CalibrationError::InvalidPercentile(_))));
        let bad_m = CalibrationParams { percentile: 5.0, margin: -0.1 };
        assert!(matches!(calibrate(&db, bad_m), Err(CalibrationError::InvalidMargin(_))));
    }

    #[test]
    fn test_percentile_lower() {
        let v = [0.1, 0.2, 0.3, 0.4, 0.5];
        assert_eq!(percentile_lower(&v, 0.0), Some(0.1));
        assert_eq!(percentile_lower(&v, 5.0), Some(0.1));
        assert_eq!(percentile_lower(&v, 50.0), Some(0.3));
        assert_eq!(percentile_lower(&v, 100.0), Some(0.5));
        assert_eq!(percentile_lower(&[], 5.0), None);
        // Rank 1.2 picks the observed 0.2, not the interpolated 0.22.
        assert_eq!(percentile_lower(&v, 30.0), Some(0.2));
    }

    #[test]
    fn test_validate_threshold() {
        assert_eq!(validate_threshold(0.0).unwrap(), 0.0);
        assert_eq!(validate_threshold(0.429).unwrap(), 0.429);
        assert_eq!(validate_threshold(2.0).unwrap(), 2.0);
        for bad in [-0.01, 2.01, f32::NAN, f32::INFINITY] {
            assert!(matches!(validate_threshold(bad), Err(CalibrationError::InvalidThreshold(_))));
        }
    }

    #[test]
    fn test_threshold_file_roundtrip() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("warden-threshold-{nanos}.toml"));

        let cal = calibrate(&db_from(abc()), CalibrationParams::default()).unwrap();
        cal.threshold.save(&path).unwrap();
        let loaded = ThresholdConfig::load(&path).unwrap();
        assert_eq!(loaded.value, cal.threshold.value);
        assert_eq!(loaded.computed_at, cal.threshold.computed_at);

        fs::write(&path, "value = nan\npercentile = 5.0\nmargin = 0.03\ncomputed_at = \"2024-01-01T00:00:00Z\"\n").unwrap();
        assert!(ThresholdConfig::load(&path).is_err());

        fs::write(&path, "value = 3.5\npercentile = 5.0\nmargin = 0.03\ncomputed_at = \"2024-01-01T00:00:00Z\"\n").unwrap();
        assert!(ThresholdConfig::load(&path).is_err());
        fs::remove_file(&path).ok();
    }
}
