//! Enrollment: identity image directories → `TemplateDatabase`.
//!
//! Per-image failures are skipped with a warning; an identity with no usable
//! image is dropped with a warning. Only an empty result is an error.

use crate::provider::{decode_image, FaceFeatureProvider, FeatureError};
use crate::templates::{EnrolledIdentity, TemplateDatabase, TemplateError};
use crate::types::Embedding;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Label → image files, in label order.
pub type ImageSets = BTreeMap<String, Vec<PathBuf>>;

#[derive(Debug, Clone, PartialEq)]
pub enum EnrollWarning {
    ImageSkipped {
        label: String,
        path: PathBuf,
        reason: String,
    },
    IdentityDropped {
        label: String,
    },
}

impl fmt::Display for EnrollWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnrollWarning::ImageSkipped { label, path, reason } => {
                write!(f, "{label}: skipped {} ({reason})", path.display())
            }
            EnrollWarning::IdentityDropped { label } => {
                write!(f, "{label}: no usable images, identity dropped")
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("cannot read enrollment directory {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("enrollment produced no identities ({} warnings)", warnings.len())]
    EnrollmentEmpty { warnings: Vec<EnrollWarning> },
    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Result of a successful enrollment batch.
#[derive(Debug)]
pub struct Enrollment {
    pub database: TemplateDatabase,
    pub warnings: Vec<EnrollWarning>,
}

/// Collect `root/<label>/<image>` entries. Hidden entries are ignored;
/// labels and files are sorted.
pub fn scan_identity_dirs(root: &Path) -> Result<ImageSets, EnrollError> {
    let scan_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| EnrollError::Scan { path, source }
    };

    let mut sets = ImageSets::new();
    for entry in fs::read_dir(root).map_err(scan_err(root))? {
        let entry = entry.map_err(scan_err(root))?;
        let dir = entry.path();
        let Some(label) = visible_name(&dir) else { continue };
        if !dir.is_dir() {
            continue;
        }

        let mut files = Vec::new();
        for file in fs::read_dir(&dir).map_err(scan_err(&dir))? {
            let path = file.map_err(scan_err(&dir))?.path();
            if path.is_file() && visible_name(&path).is_some() {
                files.push(path);
            }
        }
        files.sort();
        sets.insert(label, files);
    }
    Ok(sets)
}

fn visible_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    (!name.starts_with('.')).then(|| name.to_string())
}

/// Average and L2-normalize `samples` into an identity.
///
/// Returns `None` when there are no samples, dimensions disagree, or the
/// mean vector has zero norm.
pub fn template_from_samples(label: &str, samples: &[Embedding]) -> Option<EnrolledIdentity> {
    let mean = Embedding::mean(samples)?;
    if mean.norm() == 0.0 {
        return None;
    }
    Some(EnrolledIdentity {
        label: label.to_string(),
        template: mean.normalized(),
        sample_count: samples.len() as u32,
    })
}

/// Build a template database from labelled image files.
pub fn build<P: FaceFeatureProvider + ?Sized>(
    provider: &mut P,
    sets: &ImageSets,
) -> Result<Enrollment, EnrollError> {
    let mut warnings = Vec::new();
    let mut identities = Vec::new();

    for (label, paths) in sets {
        let mut samples = Vec::with_capacity(paths.len());

        for path in paths {
            let skip = |reason: String| EnrollWarning::ImageSkipped {
                label: label.clone(),
                path: path.clone(),
                reason,
            };

            let bytes = match fs::read(path) {
                Ok(b) => b,
                Err(e) => {
                    warn(&mut warnings, skip(e.to_string()));
                    continue;
                }
            };
            let image = match decode_image(&bytes) {
                Ok(img) => img,
                Err(e) => {
                    warn(&mut warnings, skip(e.to_string()));
                    continue;
                }
            };
            match provider.extract(&image) {
                Ok(Some(features)) => samples.push(features.embedding),
                Ok(None) => warn(&mut warnings, skip(FeatureError::NoFaceDetected.to_string())),
                Err(e) => warn(&mut warnings, skip(e.to_string())),
            }
        }

        match template_from_samples(label, &samples) {
            Some(identity) => {
                tracing::info!(label = %label, samples = samples.len(), "template built");
                identities.push(identity);
            }
            None => warn(&mut warnings, EnrollWarning::IdentityDropped { label: label.clone() }),
        }
    }

    if identities.is_empty() {
        return Err(EnrollError::EnrollmentEmpty { warnings });
    }

    let database = TemplateDatabase::new(identities)?;
    tracing::info!(identities = database.len(), warnings = warnings.len(), "enrollment complete");
    Ok(Enrollment { database, warnings })
}

fn warn(warnings: &mut Vec<EnrollWarning>, warning: EnrollWarning) {
    tracing::warn!("{warning}");
    warnings.push(warning);
}
