//! Headless capture loop: camera frames through the shared engine and alert controller.

use crate::engine::EngineHandle;
use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::mem::discriminant;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use warden_core::watch::StopReason;
use warden_core::{AlertController, BoundingBox, CaptureError, CaptureLoop, FrameSink, LoopState, TemplateDatabase};
use warden_hw::Camera;

/// Frames dropped after opening the camera while exposure settles.
const WARMUP_FRAMES: usize = 4;

/// Sink with no display: logs verdict changes and watches a stop flag.
pub struct HeadlessSink {
    stop: Arc<AtomicBool>,
    last: Option<LoopState>,
}

impl HeadlessSink {
    pub fn new(stop: Arc<AtomicBool>) -> Self {
        Self { stop, last: None }
    }

    fn changed(&self, state: &LoopState) -> bool {
        match (&self.last, state) {
            (Some(LoopState::Matched { label: a, .. }), LoopState::Matched { label: b, .. }) => a != b,
            (Some(prev), next) => discriminant(prev) != discriminant(next),
            (None, _) => true,
        }
    }
}

impl FrameSink for HeadlessSink {
    fn show(&mut self, _frame: &RgbImage, _face: Option<&BoundingBox>, state: &LoopState) -> Result<(), CaptureError> {
        if let LoopState::Alerting { evidence: Some(path), distance } = state {
            tracing::warn!(path = %path.display(), distance, "intruder evidence saved");
        } else if self.changed(state) {
            tracing::info!(state = %state, "capture state changed");
        }
        self.last = Some(state.clone());
        Ok(())
    }

    fn stop_requested(&mut self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

pub struct CaptureSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub threshold: f32,
}

/// Open the camera on a dedicated thread and run the loop there.
///
/// Returns once the camera is streaming, or with the open error. The loop
/// ends when `stop` is set or the device fails.
pub fn spawn_capture_loop(
    settings: CaptureSettings,
    engine: EngineHandle,
    db: Arc<TemplateDatabase>,
    alerts: Arc<AlertController>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();

    let handle = std::thread::Builder::new()
        .name("warden-capture".into())
        .spawn(move || {
            let camera = match Camera::open(&settings.device, settings.width, settings.height) {
                Ok(c) => c,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            let session = match camera.start_session(WARMUP_FRAMES) {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            let summary = CaptureLoop::new(session, engine, HeadlessSink::new(stop), db, settings.threshold, alerts).run();
            if let StopReason::Failed(e) = &summary.stop {
                tracing::error!(error = %e, device = %settings.device, "capture loop failed");
            }
        })
        .context("failed to spawn capture thread")?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => Err(anyhow!(e)),
        Err(_) => Err(anyhow!("capture thread exited before the camera opened")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_sink_follows_stop_flag() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut sink = HeadlessSink::new(Arc::clone(&stop));
        assert!(!sink.stop_requested());
        stop.store(true, Ordering::Relaxed);
        assert!(sink.stop_requested());
    }

    #[test]
    fn test_sink_change_detection() {
        let mut sink = HeadlessSink::new(Arc::new(AtomicBool::new(false)));
        let frame = RgbImage::new(1, 1);
        let alice = LoopState::Matched { label: "alice".into(), distance: 0.1 };

        assert!(sink.changed(&LoopState::NoFace));
        sink.show(&frame, None, &LoopState::NoFace).unwrap();
        assert!(!sink.changed(&LoopState::NoFace));
        assert!(sink.changed(&alice));

        sink.show(&frame, None, &alice).unwrap();
        assert!(!sink.changed(&LoopState::Matched { label: "alice".into(), distance: 0.2 }));
        assert!(sink.changed(&LoopState::Matched { label: "bob".into(), distance: 0.2 }));
        assert!(sink.changed(&LoopState::Alerting { distance: 0.9, evidence: Some(PathBuf::from("x.jpg")) }));
    }

    #[test]
    fn test_missing_camera_fails_fast() {
        let db = TemplateDatabase::new(vec![warden_core::EnrolledIdentity {
            label: "alice".into(),
            template: warden_core::Embedding::new(vec![1.0, 0.0]),
            sample_count: 1,
        }])
        .unwrap();
        let dir = std::env::temp_dir().join(format!("wardend-capture-{}", std::process::id()));
        let alerts = Arc::new(AlertController::new(&dir, std::time::Duration::from_secs(5)).unwrap());
        let engine = crate::engine::spawn_engine(crate::engine::tests::PixelProvider).unwrap();

        let settings = CaptureSettings {
            device: "/dev/warden-no-such-video".into(),
            width: 640,
            height: 480,
            threshold: 0.4,
        };
        let err = spawn_capture_loop(settings, engine, Arc::new(db), alerts, Arc::new(AtomicBool::new(false)));
        assert!(err.is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
