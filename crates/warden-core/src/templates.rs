//! Template database and its on-disk snapshot.
//!
//! A snapshot is a single file: magic, SHA-256 of the payload, then the
//! bincode payload. The database is validated on construction and on load,
//! so every `TemplateDatabase` in memory is non-empty, label-unique and
//! holds unit-norm templates of one dimension.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SNAPSHOT_MAGIC: &[u8; 8] = b"WRDNTPL\0";
const SNAPSHOT_VERSION: u32 = 1;
const CHECKSUM_LEN: usize = 32;
const HEADER_LEN: usize = SNAPSHOT_MAGIC.len() + CHECKSUM_LEN;

/// Allowed deviation of a template's L2 norm from 1.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-3;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("not a template snapshot (bad magic)")]
    BadMagic,
    #[error("unsupported snapshot version {0} (expected {SNAPSHOT_VERSION})")]
    UnsupportedVersion(u32),
    #[error("snapshot checksum mismatch")]
    ChecksumMismatch,
    #[error("snapshot payload corrupt: {0}")]
    Corrupt(String),
    #[error("template database is empty")]
    Empty,
    #[error("duplicate label: {0}")]
    DuplicateLabel(String),
    #[error("identity {label}: dimension {got}, expected {expected}")]
    DimensionMismatch { label: String, expected: usize, got: usize },
    #[error("identity {label}: template contains non-finite values")]
    NonFinite { label: String },
    #[error("identity {label}: template norm {norm} is not 1")]
    NotUnitNorm { label: String, norm: f32 },
    #[error("identity {label}: sample count must be at least 1")]
    NoSamples { label: String },
}

/// One enrolled person.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrolledIdentity {
    pub label: String,
    /// L2-normalized mean of the identity's sample embeddings.
    pub template: Embedding,
    pub sample_count: u32,
}

/// Ordered, label-unique, read-only gallery of enrolled identities.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateDatabase {
    identities: Vec<EnrolledIdentity>,
    dim: usize,
}

/// Wire form of the snapshot payload. Vectors are parallel, one entry per identity.
#[derive(Serialize, Deserialize)]
struct SnapshotPayload {
    version: u32,
    dim: u32,
    labels: Vec<String>,
    templates: Vec<Vec<f32>>,
    sample_counts: Vec<u32>,
    model_versions: Vec<Option<String>>,
}

impl TemplateDatabase {
    /// Validate and wrap a list of identities. Order is preserved.
    pub fn new(identities: Vec<EnrolledIdentity>) -> Result<Self, TemplateError> {
        let first = identities.first().ok_or(TemplateError::Empty)?;
        let dim = first.template.dim();

        let mut seen = HashSet::new();
        for identity in &identities {
            let label = &identity.label;
            if !seen.insert(label.as_str()) {
                return Err(TemplateError::DuplicateLabel(label.clone()));
            }
            if identity.template.dim() != dim || dim == 0 {
                return Err(TemplateError::DimensionMismatch {
                    label: label.clone(),
                    expected: dim,
                    got: identity.template.dim(),
                });
            }
            if identity.template.values.iter().any(|v| !v.is_finite()) {
                return Err(TemplateError::NonFinite { label: label.clone() });
            }
            let norm = identity.template.norm();
            if (norm - 1.0).abs() > UNIT_NORM_TOLERANCE {
                return Err(TemplateError::NotUnitNorm { label: label.clone(), norm });
            }
            if identity.sample_count == 0 {
                return Err(TemplateError::NoSamples { label: label.clone() });
            }
        }

        Ok(Self { identities, dim })
    }

    pub fn identities(&self) -> &[EnrolledIdentity] {
        &self.identities
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.identities.iter().map(|i| i.label.as_str())
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Embedding dimension shared by all templates.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn find(&self, label: &str) -> Option<&EnrolledIdentity> {
        self.identities.iter().find(|i| i.label == label)
    }

    /// Serialize to snapshot bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TemplateError> {
        let payload = SnapshotPayload {
            version: SNAPSHOT_VERSION,
            dim: self.dim as u32,
            labels: self.identities.iter().map(|i| i.label.clone()).collect(),
            templates: self.identities.iter().map(|i| i.template.values.clone()).collect(),
            sample_counts: self.identities.iter().map(|i| i.sample_count).collect(),
            model_versions: self.identities.iter().map(|i| i.template.model_version.clone()).collect(),
        };
        let body = bincode::serialize(&payload).map_err(|e| TemplateError::Corrupt(e.to_string()))?;

        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&Sha256::digest(&body));
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse and validate snapshot bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TemplateError> {
        if bytes.len() < HEADER_LEN || &bytes[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
            return Err(TemplateError::BadMagic);
        }
        let (checksum, body) = bytes[SNAPSHOT_MAGIC.len()..].split_at(CHECKSUM_LEN);
        if Sha256::digest(body).as_slice() != checksum {
            return Err(TemplateError::ChecksumMismatch);
        }

        let payload: SnapshotPayload =
            bincode::deserialize(body).map_err(|e| TemplateError::Corrupt(e.to_string()))?;
        if payload.version != SNAPSHOT_VERSION {
            return Err(TemplateError::UnsupportedVersion(payload.version));
        }

        let n = payload.labels.len();
        if payload.templates.len() != n || payload.sample_counts.len() != n || payload.model_versions.len() != n {
            return Err(TemplateError::Corrupt(format!(
                "parallel sequences differ in length: {} labels, {} templates, {} counts, {} versions",
                n,
                payload.templates.len(),
                payload.sample_counts.len(),
                payload.model_versions.len()
            )));
        }

        let identities: Vec<EnrolledIdentity> = payload
            .labels
            .into_iter()
            .zip(payload.templates)
            .zip(payload.sample_counts)
            .zip(payload.model_versions)
            .map(|(((label, values), sample_count), model_version)| EnrolledIdentity {
                label,
                template: Embedding { values, model_version },
                sample_count,
            })
            .collect();

        let db = Self::new(identities)?;
        if db.dim != payload.dim as usize {
            return Err(TemplateError::Corrupt(format!(
                "header dimension {} does not match templates ({})",
                payload.dim, db.dim
            )));
        }
        Ok(db)
    }

    /// Write the snapshot atomically (sibling temp file, then rename).
    pub fn save(&self, path: &Path) -> Result<(), TemplateError> {
        let bytes = self.to_bytes()?;
        let tmp = temp_sibling(path);

        let write_tmp = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()
        };
        write_tmp().map_err(|source| TemplateError::Io { path: tmp.clone(), source })?;
        fs::rename(&tmp, path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::info!(path = %path.display(), identities = self.len(), dim = self.dim, "template snapshot saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let bytes = fs::read(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let db = Self::from_bytes(&bytes)?;
        tracing::info!(path = %path.display(), identities = db.len(), dim = db.dim, "template snapshot loaded");
        Ok(db)
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("warden-templates-{tag}-{nanos}"));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn identity(label: &str, values: &[f32]) -> EnrolledIdentity {
        EnrolledIdentity {
            label: label.to_string(),
            template: Embedding::new(values.to_vec()).normalized(),
            sample_count: 3,
        }
    }

    fn sample_db() -> TemplateDatabase {
        let mut alice = identity("alice", &[0.3, -0.7, 0.2, 0.1]);
        alice.template.model_version = Some("facenet_vggface2".into());
        TemplateDatabase::new(vec![
            alice,
            identity("bob", &[0.9, 0.1, 0.0, -0.4]),
            identity("carol", &[-0.2, 0.2, 0.8, 0.5]),
        ])
        .unwrap()
    }

    #[test]
    fn test_roundtrip_preserves_order_and_vectors() {
        let dir = temp_dir("roundtrip");
        let path = dir.join("db.wdb");
        let db = sample_db();
        db.save(&path).unwrap();

        let loaded = TemplateDatabase::load(&path).unwrap();
        assert_eq!(loaded, db);
        assert_eq!(loaded.labels().collect::<Vec<_>>(), vec!["alice", "bob", "carol"]);
        assert!(!dir.join("db.wdb.tmp").exists());

        // Re-saving unmodified content is byte-identical.
        let again = dir.join("again.wdb");
        loaded.save(&again).unwrap();
        assert_eq!(fs::read(&path).unwrap(), fs::read(&again).unwrap());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_rejects_tampered_payload() {
        let mut bytes = sample_db().to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(TemplateDatabase::from_bytes(&bytes), Err(TemplateError::ChecksumMismatch)));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = sample_db().to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(TemplateDatabase::from_bytes(&bytes), Err(TemplateError::BadMagic)));
        assert!(matches!(TemplateDatabase::from_bytes(b"short"), Err(TemplateError::BadMagic)));
    }

    #[test]
    fn test_new_rejects_invalid_galleries() {
        assert!(matches!(TemplateDatabase::new(vec![]), Err(TemplateError::Empty)));

        let dup = vec![identity("a", &[1.0, 0.0]), identity("a", &[0.0, 1.0])];
        assert!(matches!(TemplateDatabase::new(dup), Err(TemplateError::DuplicateLabel(_))));

        let dims = vec![identity("a", &[1.0, 0.0]), identity("b", &[0.0, 1.0, 0.0])];
        assert!(matches!(TemplateDatabase::new(dims), Err(TemplateError::DimensionMismatch { .. })));

        let mut raw = identity("a", &[1.0, 0.0]);
        raw.template.values = vec![2.0, 0.0];
        assert!(matches!(TemplateDatabase::new(vec![raw]), Err(TemplateError::NotUnitNorm { .. })));

        let mut nan = identity("a", &[1.0, 0.0]);
        nan.template.values[1] = f32::NAN;
        assert!(matches!(TemplateDatabase::new(vec![nan]), Err(TemplateError::NonFinite { .. })));

        let mut zero = identity("a", &[1.0, 0.0]);
        zero.sample_count = 0;
        assert!(matches!(TemplateDatabase::new(vec![zero]), Err(TemplateError::NoSamples { .. })));
    }

    #[test]
    fn test_find() {
        let db = sample_db();
        assert_eq!(db.find("bob").map(|i| i.sample_count), Some(3));
        assert!(db.find("mallory").is_none());
        assert_eq!(db.dim(), 4);
        assert_eq!(db.len(), 3);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = TemplateDatabase::load(Path::new("/nonexistent/warden/db.wdb")).unwrap_err();
        assert!(matches!(err, TemplateError::Io { .. }));
    }
}
