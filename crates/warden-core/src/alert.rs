//! Intrusion alerts: cooldown-gated evidence writes for stranger verdicts.
//!
//! `AlertController` is shared by every serving context. The whole
//! read-compare-update-write sequence runs under one mutex, so at most one
//! evidence file is written per cooldown window no matter how many callers
//! observe a stranger at once.

use crate::types::MatchResult;
use chrono::{DateTime, Local};
use image::{ImageFormat, RgbImage};
use std::fs::{self, OpenOptions};
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

/// Upper bound on `_N` suffixes tried when timestamp names collide.
const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("evidence write failed for {path}: {source}")]
    EvidenceWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("evidence encoding failed: {0}")]
    Encode(String),
}

/// Image to persist when an alert fires.
#[derive(Debug, Clone, Copy)]
pub enum Evidence<'a> {
    /// Already-encoded bytes (e.g. an upload), written verbatim.
    Encoded(&'a [u8]),
    /// A raw frame, JPEG-encoded before writing.
    Frame(&'a RgbImage),
}

/// A fired alert.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub timestamp: DateTime<Local>,
    pub path: PathBuf,
    pub bytes_written: usize,
}

/// Process-wide cooldown state.
#[derive(Debug, Default)]
pub struct AlertState {
    last_alert: Option<Instant>,
}

impl AlertState {
    fn cooling_down(&self, now: Instant, cooldown: Duration) -> bool {
        self.last_alert
            .is_some_and(|last| now.saturating_duration_since(last) < cooldown)
    }
}

pub struct AlertController {
    evidence_dir: PathBuf,
    cooldown: Duration,
    state: Mutex<AlertState>,
}

impl AlertController {
    /// Create the controller, creating `evidence_dir` if missing.
    pub fn new(evidence_dir: impl Into<PathBuf>, cooldown: Duration) -> Result<Self, AlertError> {
        let evidence_dir = evidence_dir.into();
        fs::create_dir_all(&evidence_dir).map_err(|source| AlertError::EvidenceWrite {
            path: evidence_dir.clone(),
            source,
        })?;
        Ok(Self {
            evidence_dir,
            cooldown,
            state: Mutex::new(AlertState::default()),
        })
    }

    pub fn evidence_dir(&self) -> &Path {
        &self.evidence_dir
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Persist `evidence` if `result` is a stranger and the cooldown has elapsed.
    ///
    /// `Ok(None)` means nothing was written (not a stranger, or cooling down).
    pub fn maybe_alert(&self, result: &MatchResult, evidence: Evidence<'_>) -> Result<Option<AlertEvent>, AlertError> {
        self.maybe_alert_at(result, evidence, Instant::now(), Local::now())
    }

    fn maybe_alert_at(
        &self,
        result: &MatchResult,
        evidence: Evidence<'_>,
        now: Instant,
        wall: DateTime<Local>,
    ) -> Result<Option<AlertEvent>, AlertError> {
        if !result.stranger {
            return Ok(None);
        }

        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.cooling_down(now, self.cooldown) {
            tracing::debug!(distance = result.distance, "stranger within cooldown, no evidence written");
            return Ok(None);
        }
        // Clock moves before the write: a failing disk still rate-limits attempts.
        state.last_alert = Some(now);

        let (bytes, ext) = encode_evidence(evidence)?;
        let stem = wall.format("%Y%m%d_%H%M%S_%3f").to_string();
        let path = write_unique(&self.evidence_dir, &stem, ext, &bytes)?;

        tracing::warn!(
            path = %path.display(),
            distance = result.distance,
            bytes = bytes.len(),
            "stranger detected, evidence saved"
        );

        Ok(Some(AlertEvent {
            timestamp: wall,
            path,
            bytes_written: bytes.len(),
        }))
    }
}

fn encode_evidence(evidence: Evidence<'_>) -> Result<(Vec<u8>, &'static str), AlertError> {
    match evidence {
        Evidence::Encoded(bytes) => {
            let ext = image::guess_format(bytes)
                .ok()
                .and_then(|f| f.extensions_str().first().copied())
                .unwrap_or("jpg");
            Ok((bytes.to_vec(), ext))
        }
        Evidence::Frame(frame) => {
            let mut out = Cursor::new(Vec::new());
            frame
                .write_to(&mut out, ImageFormat::Jpeg)
                .map_err(|e| AlertError::Encode(e.to_string()))?;
            Ok((out.into_inner(), "jpg"))
        }
    }
}

/// Write `bytes` to `dir/stem.ext`, adding `_1`, `_2`, ... if the name is taken.
fn write_unique(dir: &Path, stem: &str, ext: &str, bytes: &[u8]) -> Result<PathBuf, AlertError> {
    let mut attempt = 0;
    loop {
        let name = match attempt {
            0 => format!("{stem}.{ext}"),
            n => format!("{stem}_{n}.{ext}"),
        };
        let path = dir.join(name);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                return match file.write_all(bytes) {
                    Ok(()) => Ok(path),
                    Err(source) => Err(AlertError::EvidenceWrite { path, source }),
                };
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < MAX_NAME_ATTEMPTS => {
                attempt += 1;
            }
            Err(source) => return Err(AlertError::EvidenceWrite { path, source }),
        }
    }
}
