//! FaceNet face embedder via ONNX Runtime.
//!
//! Produces 512-dimensional embeddings from square RGB face crops using an
//! InceptionResnetV1 model trained on VGGFace2.

use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const FACENET_INPUT_SIZE: usize = 160;
const FACENET_MEAN: f32 = 127.5;
const FACENET_STD: f32 = 127.5;
pub const FACENET_EMBEDDING_DIM: usize = 512;
pub const FACENET_MODEL_VERSION: &str = "facenet_vggface2";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0} (place facenet_vggface2.onnx in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// FaceNet-based face embedder.
pub struct FaceEmbedder {
    session: Session,
}

impl FaceEmbedder {
    /// Load the FaceNet ONNX model from the given path.
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded FaceNet model"
        );

        Ok(Self { session })
    }

    /// Embed a face crop. Crops of any size are resized to the model input.
    ///
    /// The returned embedding is L2-normalized.
    pub fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedderError> {
        let input = preprocess(face);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        finish_embedding(raw.to_vec())
    }
}

/// Validate and L2-normalize raw model output.
fn finish_embedding(raw: Vec<f32>) -> Result<Embedding, EmbedderError> {
    if raw.len() != FACENET_EMBEDDING_DIM {
        return Err(EmbedderError::InferenceFailed(format!(
            "expected {FACENET_EMBEDDING_DIM}-dim embedding, got {}",
            raw.len()
        )));
    }
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(EmbedderError::InferenceFailed("embedding contains non-finite values".into()));
    }

    let embedding = Embedding::new(raw);
    if embedding.norm() == 0.0 {
        return Err(EmbedderError::InferenceFailed("embedding has zero norm".into()));
    }

    let mut unit = embedding.normalized();
    unit.model_version = Some(FACENET_MODEL_VERSION.to_string());
    Ok(unit)
}

/// RGB crop → 1×3×160×160 tensor with fixed-standardization `(p - 127.5) / 127.5`.
fn preprocess(face: &RgbImage) -> Array4<f32> {
    let size = FACENET_INPUT_SIZE;
    let resized;
    let face = if face.dimensions() == (size as u32, size as u32) {
        face
    } else {
        resized = imageops::resize(face, size as u32, size as u32, FilterType::Triangle);
        &resized
    };

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - FACENET_MEAN) / FACENET_STD;
        }
    }
    tensor
}
