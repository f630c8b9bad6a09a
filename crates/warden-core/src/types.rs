use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Points to crop around: the box corners plus any landmarks.
    ///
    /// The box spans brow to chin; landmarks only cover the inner face and
    /// widen the crop only when they stray outside the box.
    pub fn anchor_points(&self) -> Vec<(f32, f32)> {
        let mut points = vec![
            (self.x, self.y),
            (self.x + self.width, self.y),
            (self.x, self.y + self.height),
            (self.x + self.width, self.y + self.height),
        ];
        if let Some(lms) = &self.landmarks {
            points.extend_from_slice(lms);
        }
        points
    }
}

/// Face embedding vector (512-dimensional for FaceNet / VGGFace2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "facenet_vggface2").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// L2 norm of the vector.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Return a unit-norm copy. A zero vector is returned unchanged.
    pub fn normalized(&self) -> Embedding {
        let norm = self.norm();
        let values = if norm > 0.0 {
            self.values.iter().map(|v| v / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }

    /// Element-wise mean of `samples`. Returns `None` for an empty slice or
    /// when the samples disagree on dimension.
    pub fn mean(samples: &[Embedding]) -> Option<Embedding> {
        let first = samples.first()?;
        let dim = first.dim();
        if samples.iter().any(|s| s.dim() != dim) {
            return None;
        }

        let mut acc = vec![0.0f32; dim];
        for sample in samples {
            for (a, v) in acc.iter_mut().zip(&sample.values) {
                *a += v;
            }
        }
        let n = samples.len() as f32;
        acc.iter_mut().for_each(|a| *a /= n);

        Some(Embedding {
            values: acc,
            model_version: first.model_version.clone(),
        })
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// Always processes all dimensions.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Cosine distance `1 - similarity`, clamped to [0, 2] against rounding.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        (1.0 - self.similarity(other)).clamp(0.0, 2.0)
    }
}

/// Verdict for one recognition request or frame.
///
/// `label` is `None` exactly when `stranger` is true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    #[serde(rename = "time")]
    pub timestamp: DateTime<Utc>,
    /// Cosine distance to the nearest template, in [0, 2].
    pub distance: f32,
    pub label: Option<String>,
    pub stranger: bool,
}

impl MatchResult {
    pub fn matched(label: impl Into<String>, distance: f32) -> Self {
        Self {
            timestamp: Utc::now(),
            distance,
            label: Some(label.into()),
            stranger: false,
        }
    }

    pub fn stranger(distance: f32) -> Self {
        Self {
            timestamp: Utc::now(),
            distance,
            label: None,
            stranger: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        let b = emb(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let a = emb(&[0.3, -0.2, 0.9, 0.1]).normalized();
        assert!(a.cosine_distance(&a).abs() < 1e-6);
    }

    #[test]
    fn test_distance_opposite_is_two() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[-1.0, 0.0]);
        assert!((a.cosine_distance(&b) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_orthogonal_is_one() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[0.0, 1.0]);
        assert!((a.cosine_distance(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_always_in_range() {
        let vectors = [
            emb(&[1.0, 2.0, 3.0]),
            emb(&[-1.0, -2.0, -3.0]),
            emb(&[0.0, 0.0, 0.0]),
            emb(&[1e-20, 0.0, 0.0]),
            emb(&[100.0, -250.0, 0.5]),
        ];
        for a in &vectors {
            for b in &vectors {
                let d = a.cosine_distance(b);
                assert!((0.0..=2.0).contains(&d), "distance {d} out of range");
            }
        }
    }

    #[test]
    fn test_normalized_has_unit_norm() {
        let a = emb(&[3.0, 4.0]).normalized();
        assert!((a.norm() - 1.0).abs() < 1e-6);
        assert!((a.values[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_zero_vector_unchanged() {
        let a = emb(&[0.0, 0.0]).normalized();
        assert_eq!(a.values, vec![0.0, 0.0]);
    }

    #[test]
    fn test_mean() {
        let m = Embedding::mean(&[emb(&[1.0, 0.0]), emb(&[0.0, 1.0])]).unwrap();
        assert_eq!(m.values, vec![0.5, 0.5]);
    }

    #[test]
    fn test_mean_rejects_empty_and_mixed_dims() {
        assert!(Embedding::mean(&[]).is_none());
        assert!(Embedding::mean(&[emb(&[1.0]), emb(&[1.0, 0.0])]).is_none());
    }

    #[test]
    fn test_anchor_points_are_box_corners() {
        let face = BoundingBox {
            x: 10.0, y: 20.0, width: 30.0, height: 40.0,
            confidence: 0.9, landmarks: None,
        };
        let pts = face.anchor_points();
        assert_eq!(pts.len(), 4);
        assert_eq!(pts[3], (40.0, 60.0));
    }

    #[test]
    fn test_anchor_points_keep_corners_with_landmarks() {
        let face = BoundingBox {
            x: 10.0, y: 20.0, width: 30.0, height: 40.0,
            confidence: 0.9,
            landmarks: Some([(20.0, 35.0), (30.0, 35.0), (25.0, 45.0), (21.0, 52.0), (29.0, 52.0)]),
        };
        let pts = face.anchor_points();
        assert_eq!(pts.len(), 9);
        assert_eq!(pts[0], (10.0, 20.0));
        assert_eq!(pts[3], (40.0, 60.0));
    }

    #[test]
    fn test_match_result_label_iff_not_stranger() {
        let ok = MatchResult::matched("alice", 0.1);
        assert!(!ok.stranger);
        assert_eq!(ok.label.as_deref(), Some("alice"));

        let bad = MatchResult::stranger(0.9);
        assert!(bad.stranger);
        assert!(bad.label.is_none());
    }
}
