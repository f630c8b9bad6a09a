//! Face Feature Provider: image → (face box, normalized embedding) or "no face".
//!
//! Everything downstream (enrollment, matching, the capture loop) talks to
//! this trait only. The ONNX implementation chains SCRFD detection, the
//! face-box square crop and FaceNet embedding.

use crate::crop::{self, CropConfig};
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{EmbedderError, FaceEmbedder};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const EMBEDDER_MODEL_FILE: &str = "facenet_vggface2.onnx";

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("feature provider failed: {0}")]
    Provider(String),
}

impl From<DetectorError> for FeatureError {
    fn from(e: DetectorError) -> Self {
        FeatureError::Provider(e.to_string())
    }
}

impl From<EmbedderError> for FeatureError {
    fn from(e: EmbedderError) -> Self {
        FeatureError::Provider(e.to_string())
    }
}

/// One detected face and its embedding.
#[derive(Debug, Clone)]
pub struct FaceFeatures {
    pub face: BoundingBox,
    pub embedding: Embedding,
}

/// Source of face features for a single RGB image.
pub trait FaceFeatureProvider {
    /// Returns `Ok(None)` when the image holds no usable face.
    fn extract(&mut self, image: &RgbImage) -> Result<Option<FaceFeatures>, FeatureError>;
}

impl<P: FaceFeatureProvider + ?Sized> FaceFeatureProvider for Box<P> {
    fn extract(&mut self, image: &RgbImage) -> Result<Option<FaceFeatures>, FeatureError> {
        (**self).extract(image)
    }
}

impl<P: FaceFeatureProvider + ?Sized> FaceFeatureProvider for &mut P {
    fn extract(&mut self, image: &RgbImage) -> Result<Option<FaceFeatures>, FeatureError> {
        (**self).extract(image)
    }
}

/// Decode arbitrary-format image bytes into RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, FeatureError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| FeatureError::Decode(e.to_string()))
}

/// Decode `bytes` and extract features, mapping "no face" to an error.
pub fn features_from_bytes<P: FaceFeatureProvider + ?Sized>(
    provider: &mut P,
    bytes: &[u8],
) -> Result<FaceFeatures, FeatureError> {
    let image = decode_image(bytes)?;
    provider.extract(&image)?.ok_or(FeatureError::NoFaceDetected)
}

/// SCRFD + crop + FaceNet.
pub struct OnnxFeatureProvider {
    detector: FaceDetector,
    embedder: FaceEmbedder,
    crop: CropConfig,
}

impl OnnxFeatureProvider {
    pub fn load(
        detector_path: &str,
        embedder_path: &str,
        crop: CropConfig,
        intra_threads: usize,
    ) -> Result<Self, FeatureError> {
        let detector = FaceDetector::load(detector_path, intra_threads)?;
        let embedder = FaceEmbedder::load(embedder_path, intra_threads)?;
        Ok(Self {
            detector,
            embedder,
            crop,
        })
    }

    /// Load both models from their default file names inside `model_dir`.
    pub fn from_model_dir(model_dir: &Path, crop: CropConfig, intra_threads: usize) -> Result<Self, FeatureError> {
        let det = model_dir.join(DETECTOR_MODEL_FILE);
        let emb = model_dir.join(EMBEDDER_MODEL_FILE);
        Self::load(&det.to_string_lossy(), &emb.to_string_lossy(), crop, intra_threads)
    }
}

impl FaceFeatureProvider for OnnxFeatureProvider {
    fn extract(&mut self, image: &RgbImage) -> Result<Option<FaceFeatures>, FeatureError> {
        let faces = self.detector.detect(image)?;
        let Some(face) = faces.into_iter().next() else {
            return Ok(None);
        };

        let Some(crop) = crop::crop_face(image, &face.anchor_points(), &self.crop) else {
            tracing::debug!(x = face.x, y = face.y, "face box outside frame, ignoring");
            return Ok(None);
        };

        let embedding = self.embedder.embed(&crop)?;
        Ok(Some(FaceFeatures { face, embedding }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    struct FixedProvider(Option<FaceFeatures>);

    impl FaceFeatureProvider for FixedProvider {
        fn extract(&mut self, _image: &RgbImage) -> Result<Option<FaceFeatures>, FeatureError> {
            Ok(self.0.clone())
        }
    }

    fn png_bytes() -> Vec<u8> {
        let img = RgbImage::from_pixel(8, 8, Rgb([1, 2, 3]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_decode_image_png() {
        let img = decode_image(&png_bytes()).unwrap();
        assert_eq!(img.dimensions(), (8, 8));
        assert_eq!(img.get_pixel(0, 0), &Rgb([1, 2, 3]));
    }

    #[test]
    fn test_decode_image_garbage() {
        assert!(matches!(decode_image(b"not an image"), Err(FeatureError::Decode(_))));
    }

    #[test]
    fn test_features_from_bytes_no_face() {
        let mut provider = FixedProvider(None);
        let err = features_from_bytes(&mut provider, &png_bytes()).unwrap_err();
        assert!(matches!(err, FeatureError::NoFaceDetected));
    }

    #[test]
    fn test_features_from_bytes_boxed() {
        let features = FaceFeatures {
            face: BoundingBox {
                x: 0.0, y: 0.0, width: 4.0, height: 4.0,
                confidence: 0.99, landmarks: None,
            },
            embedding: Embedding::new(vec![1.0, 0.0]),
        };
        let mut provider: Box<dyn FaceFeatureProvider> = Box::new(FixedProvider(Some(features)));
        let got = features_from_bytes(&mut provider, &png_bytes()).unwrap();
        assert_eq!(got.embedding.values, vec![1.0, 0.0]);
    }

    #[test]
    fn test_missing_models_are_provider_errors() {
        let dir = std::env::temp_dir().join("warden-no-models");
        let err = OnnxFeatureProvider::from_model_dir(&dir, CropConfig::default(), 1)
            .err()
            .unwrap();
        assert!(matches!(err, FeatureError::Provider(_)));
    }
}
