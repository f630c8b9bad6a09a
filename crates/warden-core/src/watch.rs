//! Continuous capture loop.
//!
//! Each cycle is capture → features → match → maybe alert → render, run to
//! completion before the next frame is read. The operator's stop signal is
//! checked between cycles only.

use crate::alert::{AlertController, Evidence};
use crate::matcher::{CosineMatcher, Matcher};
use crate::provider::FaceFeatureProvider;
use crate::templates::TemplateDatabase;
use crate::types::BoundingBox;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

const MATCH_COLOUR: Rgb<u8> = Rgb([0, 255, 0]);
const ALERT_COLOUR: Rgb<u8> = Rgb([255, 0, 0]);

#[derive(Error, Debug)]
pub enum CaptureError {
    /// The capture device stopped yielding frames.
    #[error("capture failed: {0}")]
    Failed(String),
    #[error("display failed: {0}")]
    Display(String),
}

/// Something that yields RGB frames, one per call.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<RgbImage, CaptureError>;
}

/// Where processed frames go.
pub trait FrameSink {
    fn show(&mut self, frame: &RgbImage, face: Option<&BoundingBox>, state: &LoopState) -> Result<(), CaptureError>;

    /// Polled between cycles; `true` ends the loop.
    fn stop_requested(&mut self) -> bool;
}

impl<K: FrameSink + ?Sized> FrameSink for &mut K {
    fn show(&mut self, frame: &RgbImage, face: Option<&BoundingBox>, state: &LoopState) -> Result<(), CaptureError> {
        (**self).show(frame, face, state)
    }

    fn stop_requested(&mut self) -> bool {
        (**self).stop_requested()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopState {
    NoFace,
    Matched { label: String, distance: f32 },
    /// `evidence` is set only when this frame actually fired an alert.
    Alerting { distance: f32, evidence: Option<PathBuf> },
    /// Shown once, over the last frame, when the operator stops the loop.
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopState::NoFace => write!(f, "no face"),
            LoopState::Matched { label, distance } => write!(f, "OK: {label} ({distance:.3})"),
            LoopState::Alerting { distance, evidence: Some(path) } => {
                write!(f, "INTRUDER ({distance:.3}) saved {}", path.display())
            }
            LoopState::Alerting { distance, evidence: None } => write!(f, "INTRUDER ({distance:.3})"),
            LoopState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug)]
pub enum StopReason {
    Operator,
    Failed(CaptureError),
}

#[derive(Debug)]
pub struct LoopSummary {
    pub frames: u64,
    pub no_face: u64,
    pub matched: u64,
    pub strangers: u64,
    pub alerts_written: u64,
    pub stop: StopReason,
}

pub struct CaptureLoop<S, P, K> {
    source: S,
    provider: P,
    sink: K,
    db: Arc<TemplateDatabase>,
    threshold: f32,
    alerts: Arc<AlertController>,
}

impl<S: FrameSource, P: FaceFeatureProvider, K: FrameSink> CaptureLoop<S, P, K> {
    pub fn new(
        source: S,
        provider: P,
        sink: K,
        db: Arc<TemplateDatabase>,
        threshold: f32,
        alerts: Arc<AlertController>,
    ) -> Self {
        Self {
            source,
            provider,
            sink,
            db,
            threshold,
            alerts,
        }
    }

    /// Run until the sink asks to stop or the source fails.
    ///
    /// Consumes the loop so the source (and its device) is released on return.
    pub fn run(mut self) -> LoopSummary {
        let mut summary = LoopSummary {
            frames: 0,
            no_face: 0,
            matched: 0,
            strangers: 0,
            alerts_written: 0,
            stop: StopReason::Operator,
        };

        let mut last_frame: Option<RgbImage> = None;
        loop {
            if self.sink.stop_requested() {
                if let Some(frame) = &last_frame {
                    if let Err(e) = self.sink.show(frame, None, &LoopState::Stopped) {
                        tracing::debug!(error = %e, "could not show final state");
                    }
                }
                break;
            }

            let mut frame = match self.source.read_frame() {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(error = %e, frames = summary.frames, "capture loop ending");
                    summary.stop = StopReason::Failed(e);
                    break;
                }
            };
            summary.frames += 1;

            let (face, state) = self.process(&mut frame, &mut summary);

            if let Err(e) = self.sink.show(&frame, face.as_ref(), &state) {
                tracing::warn!(error = %e, "display failed, capture loop ending");
                summary.stop = StopReason::Failed(e);
                break;
            }
            last_frame = Some(frame);
        }

        tracing::info!(
            frames = summary.frames,
            no_face = summary.no_face,
            matched = summary.matched,
            strangers = summary.strangers,
            alerts = summary.alerts_written,
            "capture loop stopped"
        );
        summary
    }

    fn process(&mut self, frame: &mut RgbImage, summary: &mut LoopSummary) -> (Option<BoundingBox>, LoopState) {
        let features = match self.provider.extract(frame) {
            Ok(Some(f)) => f,
            Ok(None) => {
                summary.no_face += 1;
                return (None, LoopState::NoFace);
            }
            Err(e) => {
                tracing::warn!(error = %e, "feature extraction failed for frame");
                summary.no_face += 1;
                return (None, LoopState::NoFace);
            }
        };

        let result = CosineMatcher.compare(&features.embedding, &self.db, self.threshold);
        match result.label.clone() {
            Some(label) => {
                summary.matched += 1;
                draw_overlay(frame, &features.face, MATCH_COLOUR);
                (Some(features.face), LoopState::Matched { label, distance: result.distance })
            }
            None => {
                summary.strangers += 1;
                // Overlay first so saved evidence shows the verdict.
                draw_overlay(frame, &features.face, ALERT_COLOUR);
                let evidence = match self.alerts.maybe_alert(&result, Evidence::Frame(frame)) {
                    Ok(Some(event)) => {
                        summary.alerts_written += 1;
                        Some(event.path)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        tracing::warn!(error = %e, "evidence write failed");
                        None
                    }
                };
                (
                    Some(features.face),
                    LoopState::Alerting { distance: result.distance, evidence },
                )
            }
        }
    }
}

/// Draw a two-pixel hollow rectangle around `face`, clipped to the frame.
pub fn draw_overlay(frame: &mut RgbImage, face: &BoundingBox, colour: Rgb<u8>) {
    let (w, h) = (frame.width() as f32, frame.height() as f32);
    let x1 = face.x.clamp(0.0, w) as i32;
    let y1 = face.y.clamp(0.0, h) as i32;
    let x2 = (face.x + face.width).clamp(0.0, w) as i32;
    let y2 = (face.y + face.height).clamp(0.0, h) as i32;

    let rect_w = (x2 - x1).max(1) as u32;
    let rect_h = (y2 - y1).max(1) as u32;
    draw_hollow_rect_mut(frame, Rect::at(x1, y1).of_size(rect_w, rect_h), colour);
    if rect_w > 2 && rect_h > 2 {
        draw_hollow_rect_mut(frame, Rect::at(x1 + 1, y1 + 1).of_size(rect_w - 2, rect_h - 2), colour);
    }
}
