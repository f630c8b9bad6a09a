//! HTTP request-response adapter.
//!
//! `POST /predict` accepts a multipart upload or a JSON body carrying a
//! base64 image; `POST /predict/file` accepts multipart only. Both run the
//! engine → matcher → alert controller pipeline and answer with a
//! `MatchResult`.

use crate::engine::{EngineError, EngineHandle};
use axum::body::Bytes;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State};
use axum::http::{header::CONTENT_TYPE, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::Instrument;
use uuid::Uuid;
use warden_core::{AlertController, CosineMatcher, Evidence, FeatureError, MatchResult, Matcher, TemplateDatabase};

/// Shared, read-only serving state. Only the alert controller mutates.
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub db: Arc<TemplateDatabase>,
    pub threshold: f32,
    pub alerts: Arc<AlertController>,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("image could not be decoded: {0}")]
    DecodeFailed(String),
    #[error("no face detected")]
    NoFace,
    #[error("invalid base64 payload: {0}")]
    BadBase64(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("request body too large: {0}")]
    PayloadTooLarge(String),
    #[error("feature provider failed: {0}")]
    Provider(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::DecodeFailed(_) => (StatusCode::BAD_REQUEST, "decode_failed"),
            ApiError::NoFace => (StatusCode::BAD_REQUEST, "no_face"),
            ApiError::BadBase64(_) => (StatusCode::BAD_REQUEST, "bad_base64"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large"),
            ApiError::Provider(_) => (StatusCode::INTERNAL_SERVER_ERROR, "provider_failure"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl ApiError {
    /// Map an extractor rejection, keeping 413 when the body limit was hit.
    fn rejected(status: StatusCode, message: String) -> Self {
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(message)
        } else {
            ApiError::BadRequest(message)
        }
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(e: MultipartRejection) -> Self {
        ApiError::rejected(e.status(), e.body_text())
    }
}

impl From<BytesRejection> for ApiError {
    fn from(e: BytesRejection) -> Self {
        ApiError::rejected(e.status(), e.body_text())
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        ApiError::rejected(e.status(), e.body_text())
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Feature(FeatureError::Decode(msg)) => ApiError::DecodeFailed(msg),
            EngineError::Feature(FeatureError::NoFaceDetected) => ApiError::NoFace,
            EngineError::Feature(FeatureError::Provider(msg)) => ApiError::Provider(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code, "request failed");
        } else {
            tracing::info!(error = %self, code, "request rejected");
        }
        (status, Json(serde_json::json!({ "detail": code }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct PredictJson {
    image: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictResponse {
    pub time: DateTime<Utc>,
    pub distance: f32,
    pub stranger: bool,
    pub label: Option<String>,
}

impl From<MatchResult> for PredictResponse {
    fn from(r: MatchResult) -> Self {
        Self {
            time: r.timestamp,
            distance: (r.distance * 1000.0).round() / 1000.0,
            stranger: r.stranger,
            label: r.label,
        }
    }
}

/// Build the router with all routes and layers.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/predict", post(predict))
        .route("/predict/file", post(predict_file))
        .route("/health", get(health))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "identities": state.db.len(),
        "threshold": state.threshold,
        "cooldown_secs": state.alerts.cooldown().as_secs(),
    }))
}

/// Multipart upload or JSON `{"image": "<base64>"}`, chosen by content type.
async fn predict(State(state): State<AppState>, request: Request) -> Result<Json<PredictResponse>, ApiError> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let image = if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &state).await?;
        read_upload(multipart).await?
    } else if content_type.starts_with("application/json") {
        let body = Bytes::from_request(request, &state).await?;
        let payload: PredictJson =
            serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
        decode_base64_image(&payload.image)?
    } else {
        return Err(ApiError::BadRequest(format!(
            "unsupported content type {content_type:?}, expected multipart/form-data or application/json"
        )));
    };

    run_prediction(&state, image).await.map(Json)
}

async fn predict_file(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    let multipart = multipart?;
    let image = read_upload(multipart).await?;
    run_prediction(&state, image).await.map(Json)
}

/// Bytes of the `file` field, or of the first field carrying a file name.
async fn read_upload(mut multipart: Multipart) -> Result<Arc<[u8]>, ApiError> {
    let mut fallback: Option<Bytes> = None;
    while let Some(field) = multipart.next_field().await? {
        let named_file = field.name() == Some("file");
        let has_filename = field.file_name().is_some();
        if !named_file && (!has_filename || fallback.is_some()) {
            continue;
        }
        let data = field.bytes().await?;
        if named_file {
            return Ok(Arc::from(&data[..]));
        }
        fallback = Some(data);
    }
    fallback
        .map(|data| Arc::from(&data[..]))
        .ok_or_else(|| ApiError::BadRequest("multipart body has no file field".into()))
}

/// Decode a base64 image, dropping any `data:<mime>;base64,` prefix.
fn decode_base64_image(encoded: &str) -> Result<Arc<[u8]>, ApiError> {
    let payload = encoded.rsplit_once(',').map_or(encoded, |(_, data)| data).trim();
    base64::prelude::BASE64_STANDARD
        .decode(payload)
        .map(Arc::from)
        .map_err(|e| ApiError::BadBase64(e.to_string()))
}

async fn run_prediction(state: &AppState, image: Arc<[u8]>) -> Result<PredictResponse, ApiError> {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("predict", %request_id, bytes = image.len());

    async move {
        let features = state.engine.extract_encoded(Arc::clone(&image)).await?;
        let result = CosineMatcher.compare(&features.embedding, &state.db, state.threshold);
        tracing::info!(
            label = result.label.as_deref().unwrap_or("-"),
            distance = result.distance,
            stranger = result.stranger,
            "prediction"
        );

        if result.stranger {
            let alerts = Arc::clone(&state.alerts);
            let verdict = result.clone();
            let written =
                tokio::task::spawn_blocking(move || alerts.maybe_alert(&verdict, Evidence::Encoded(&image[..]))).await;
            match written {
                Ok(Ok(Some(event))) => tracing::debug!(path = %event.path.display(), "alert fired"),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "evidence write failed"),
                Err(e) => tracing::warn!(error = %e, "alert task failed"),
            }
        }

        Ok(result.into())
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::engine::tests::{png_of, PixelProvider};
    use axum::body::Body;
    use axum::http;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tower::ServiceExt;
    use warden_core::{EnrolledIdentity, Embedding};

    const BOUNDARY: &str = "warden-test-boundary";

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("wardend-api-{tag}-{nanos}"))
    }

    fn identity(label: &str, values: [f32; 3]) -> EnrolledIdentity {
        EnrolledIdentity {
            label: label.into(),
            template: Embedding::new(values.to_vec()),
            sample_count: 1,
        }
    }

    fn app(evidence: &Path) -> Router {
        app_with_limit(evidence, 1024 * 1024)
    }

    fn app_with_limit(evidence: &Path, max_upload_bytes: usize) -> Router {
        let db = TemplateDatabase::new(vec![identity("alice", [1.0, 0.0, 0.0]), identity("bob", [0.0, 0.0, 1.0])])
            .unwrap();
        let state = AppState {
            engine: spawn_engine(PixelProvider).unwrap(),
            db: Arc::new(db),
            threshold: 0.3,
            alerts: Arc::new(AlertController::new(evidence, Duration::from_secs(60)).unwrap()),
        };
        router(state, max_upload_bytes)
    }

    fn multipart_request(uri: &str, field: &str, filename: Option<&str>, data: &[u8]) -> Request {
        let disposition = match filename {
            Some(f) => format!("form-data; name=\"{field}\"; filename=\"{f}\""),
            None => format!("form-data; name=\"{field}\""),
        };
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: {disposition}\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap()
    }

    fn json_request(image: &str) -> Request {
        http::Request::builder()
            .method("POST")
            .uri("/predict")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::json!({ "image": image }).to_string()))
            .unwrap()
    }

    async fn send(app: &Router, req: Request) -> (StatusCode, serde_json::Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn evidence_count(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = temp_dir("health");
        let app = app(&dir);
        let req = http::Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["identities"], 2);
        assert_eq!(body["cooldown_secs"], 60);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_multipart_upload_matches() {
        let dir = temp_dir("multipart");
        let app = app(&dir);
        let req = multipart_request("/predict", "file", Some("me.png"), &png_of([255, 0, 0]));
        let (status, body) = send(&app, req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["label"], "alice");
        assert_eq!(body["stranger"], false);
        assert_eq!(body["distance"].as_f64().unwrap(), 0.0);
        assert!(body["time"].as_str().unwrap().contains('T'));
        assert_eq!(evidence_count(&dir), 0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_predict_file_accepts_any_named_file_field() {
        let dir = temp_dir("file");
        let app = app(&dir);
        let req = multipart_request("/predict/file", "upload", Some("cam.png"), &png_of([0, 0, 255]));
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["label"], "bob");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_json_stranger_writes_one_evidence_file() {
        let dir = temp_dir("stranger");
        let app = app(&dir);
        let encoded = base64::prelude::BASE64_STANDARD.encode(png_of([0, 255, 1]));

        for _ in 0..2 {
            let (status, body) = send(&app, json_request(&format!("data:image/png;base64,{encoded}"))).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["stranger"], true);
            assert!(body["label"].is_null());
        }

        // Second stranger fell inside the cooldown.
        assert_eq!(evidence_count(&dir), 1);
        let written = std::fs::read_dir(&dir).unwrap().next().unwrap().unwrap().path();
        assert_eq!(written.extension().and_then(|e| e.to_str()), Some("png"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_client_errors() {
        let dir = temp_dir("client");
        let app = app(&dir);

        let (status, body) = send(&app, json_request("***not base64***")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "bad_base64");

        let garbage = base64::prelude::BASE64_STANDARD.encode(b"definitely not an image");
        let (status, body) = send(&app, json_request(&garbage)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "decode_failed");

        let req = multipart_request("/predict", "file", Some("empty.png"), &png_of([0, 0, 0]));
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "no_face");

        let req = multipart_request("/predict", "note", None, b"hello");
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "bad_request");

        let req = http::Request::builder()
            .method("POST")
            .uri("/predict")
            .header(CONTENT_TYPE, "text/plain")
            .body(Body::from("hi"))
            .unwrap();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "bad_request");

        let (status, body) = send(&app, {
            let mut req = json_request("AAAA");
            *req.uri_mut() = "/predict/file".parse().unwrap();
            req
        })
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["detail"], "bad_request");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_oversized_body_is_payload_too_large() {
        let dir = temp_dir("limit");
        let app = app_with_limit(&dir, 256);
        let big = vec![7u8; 4096];

        let encoded = base64::prelude::BASE64_STANDARD.encode(&big);
        let (status, body) = send(&app, json_request(&encoded)).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["detail"], "payload_too_large");

        for uri in ["/predict", "/predict/file"] {
            let (status, body) = send(&app, multipart_request(uri, "file", Some("big.png"), &big)).await;
            assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE, "{uri}");
            assert_eq!(body["detail"], "payload_too_large");
        }
        assert_eq!(evidence_count(&dir), 0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_provider_failure_is_server_error() {
        let dir = temp_dir("provider");
        let app = app(&dir);
        let req = multipart_request("/predict", "file", Some("x.png"), &png_of([0, 255, 0]));
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["detail"], "provider_failure");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_base64_prefix_stripped() {
        let raw = decode_base64_image("data:image/jpeg;base64,aGVsbG8=").unwrap();
        assert_eq!(&raw[..], b"hello");
        let raw = decode_base64_image(" aGVsbG8= ").unwrap();
        assert_eq!(&raw[..], b"hello");
    }

    #[test]
    fn test_distance_rounded() {
        let r = PredictResponse::from(MatchResult::stranger(0.123_456));
        assert!((r.distance - 0.123).abs() < 1e-6);
    }
}
