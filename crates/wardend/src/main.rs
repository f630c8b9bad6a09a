use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use warden_core::{AlertController, OnnxFeatureProvider, TemplateDatabase};

mod api;
mod capture;
mod config;
mod engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("wardend starting");

    let config = config::Config::from_env().context("invalid configuration")?;
    let threshold = config.effective_threshold().context("failed to load threshold file")?;

    let db = TemplateDatabase::load(&config.db_path)
        .with_context(|| format!("failed to load template snapshot {}", config.db_path.display()))?;
    tracing::info!(
        path = %config.db_path.display(),
        identities = db.len(),
        dim = db.dim(),
        threshold,
        "template database loaded"
    );
    let db = Arc::new(db);

    let provider = OnnxFeatureProvider::load(
        &config.detector_model_path(),
        &config.embedder_model_path(),
        config.crop,
        config.intra_threads,
    )
    .context("failed to load face models")?;
    tracing::info!(model_dir = %config.model_dir.display(), "face models loaded");

    let engine = engine::spawn_engine(provider)?;

    let alerts = Arc::new(
        AlertController::new(&config.evidence_dir, config.cooldown).context("failed to prepare evidence directory")?,
    );
    tracing::info!(
        dir = %config.evidence_dir.display(),
        cooldown_secs = config.cooldown.as_secs(),
        "alert controller ready"
    );

    let stop = Arc::new(AtomicBool::new(false));
    let capture = match &config.camera_device {
        Some(device) => {
            let settings = capture::CaptureSettings {
                device: device.clone(),
                width: config.camera_width,
                height: config.camera_height,
                threshold,
            };
            let handle = capture::spawn_capture_loop(
                settings,
                engine.clone(),
                Arc::clone(&db),
                Arc::clone(&alerts),
                Arc::clone(&stop),
            )
            .with_context(|| format!("failed to start capture loop on {device}"))?;
            tracing::info!(device = %device, "headless capture loop running");
            Some(handle)
        }
        None => {
            tracing::info!("WARDEN_CAMERA_DEVICE not set, capture loop disabled");
            None
        }
    };

    let state = api::AppState {
        engine,
        db,
        threshold,
        alerts,
    };
    let app = api::router(state, config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(addr = %config.bind, "wardend ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    stop.store(true, Ordering::Relaxed);
    if let Some(handle) = capture {
        // The loop notices the flag after its current frame.
        if !matches!(tokio::task::spawn_blocking(move || handle.join()).await, Ok(Ok(()))) {
            tracing::warn!("capture thread did not shut down cleanly");
        }
    }

    tracing::info!("wardend shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
