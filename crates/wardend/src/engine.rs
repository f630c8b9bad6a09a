use image::RgbImage;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use warden_core::provider::{decode_image, FaceFeatureProvider, FaceFeatures, FeatureError};

/// Pending requests the engine queue holds before senders wait.
const QUEUE_DEPTH: usize = 4;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl From<EngineError> for FeatureError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Feature(inner) => inner,
            other => FeatureError::Provider(other.to_string()),
        }
    }
}

type Reply = oneshot::Sender<Result<Option<FaceFeatures>, FeatureError>>;

/// Messages sent from HTTP handlers and the capture thread to the engine thread.
enum EngineRequest {
    /// Encoded image bytes, decoded on the engine thread.
    Encoded { bytes: Arc<[u8]>, reply: Reply },
    /// An already-decoded frame.
    Frame { image: RgbImage, reply: Reply },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Decode `bytes` and extract the first face. No face is `FeatureError::NoFaceDetected`.
    pub async fn extract_encoded(&self, bytes: Arc<[u8]>) -> Result<FaceFeatures, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Encoded { bytes, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        let features = reply_rx.await.map_err(|_| EngineError::ChannelClosed)??;
        features.ok_or(EngineError::Feature(FeatureError::NoFaceDetected))
    }

    /// Blocking variant for non-async threads. Panics if called inside a tokio runtime.
    pub fn extract_blocking(&self, image: RgbImage) -> Result<Option<FaceFeatures>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .blocking_send(EngineRequest::Frame { image, reply: reply_tx })
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.blocking_recv().map_err(|_| EngineError::ChannelClosed)??)
    }
}

/// Lets the headless capture loop share the daemon's loaded models.
impl FaceFeatureProvider for EngineHandle {
    fn extract(&mut self, image: &RgbImage) -> Result<Option<FaceFeatures>, FeatureError> {
        Ok(self.extract_blocking(image.clone())?)
    }
}

/// Spawn the inference engine on a dedicated OS thread.
///
/// The provider (and its ONNX sessions) lives on that thread; requests are
/// served one at a time in arrival order. The thread exits once every
/// handle has been dropped.
pub fn spawn_engine<P>(mut provider: P) -> Result<EngineHandle, EngineError>
where
    P: FaceFeatureProvider + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("warden-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                let started = Instant::now();
                let (result, reply) = match req {
                    EngineRequest::Encoded { bytes, reply } => {
                        let result = decode_image(&bytes).and_then(|img| provider.extract(&img));
                        (result, reply)
                    }
                    EngineRequest::Frame { image, reply } => (provider.extract(&image), reply),
                };
                tracing::debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    face = matches!(result, Ok(Some(_))),
                    "extraction finished"
                );
                // The requester may have gone away; nothing to do then.
                let _ = reply.send(result);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}
