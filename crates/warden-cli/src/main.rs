use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use warden_core::calibrate::{validate_threshold, DEFAULT_MARGIN, DEFAULT_PERCENTILE};
use warden_core::crop::{DEFAULT_CROP_MARGIN, DEFAULT_CROP_SIZE};
use warden_core::watch::StopReason;
use warden_core::{
    enroll, AlertController, CalibrationParams, CaptureLoop, CropConfig, EnrollError, OnnxFeatureProvider,
    TemplateDatabase, ThresholdConfig, DEFAULT_THRESHOLD,
};
use warden_hw::Camera;

mod preview;

const DEFAULT_DB: &str = "server_admins.wdb";

#[derive(Parser)]
#[command(name = "warden", version, about = "Face identity verification and intruder alerting")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Model location and preprocessing, shared by every command that runs inference.
#[derive(Args, Debug)]
struct ModelArgs {
    /// Directory holding det_10g.onnx and facenet_vggface2.onnx
    /// [default: $WARDEN_MODEL_DIR or /usr/share/warden/models]
    #[arg(long)]
    model_dir: Option<PathBuf>,
    /// Extra crop side as a fraction of the face box
    #[arg(long, default_value_t = DEFAULT_CROP_MARGIN)]
    crop_margin: f32,
    /// Crop output size in pixels
    #[arg(long, default_value_t = DEFAULT_CROP_SIZE)]
    crop_size: u32,
    /// ONNX Runtime intra-op threads
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl ModelArgs {
    fn crop_config(&self) -> Result<CropConfig> {
        let crop = CropConfig {
            margin: self.crop_margin,
            size: self.crop_size,
        };
        crop.validate().context("invalid --crop-size / --crop-margin")?;
        Ok(crop)
    }

    fn load_provider(&self) -> Result<OnnxFeatureProvider> {
        let crop = self.crop_config()?;
        let dir = self.model_dir.clone().unwrap_or_else(warden_core::default_model_dir);
        OnnxFeatureProvider::from_model_dir(&dir, crop, self.threads)
            .with_context(|| format!("failed to load face models from {}", dir.display()))
    }
}

/// Decision threshold: a calibration file wins over the literal value.
#[derive(Args, Debug)]
struct ThresholdArgs {
    /// Maximum cosine distance accepted as a match
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: f32,
    /// Threshold file written by `warden calibrate --out`
    #[arg(long)]
    threshold_file: Option<PathBuf>,
}

impl ThresholdArgs {
    fn resolve(&self) -> Result<f32> {
        match &self.threshold_file {
            Some(path) => Ok(ThresholdConfig::load(path)?.value),
            None => validate_threshold(self.threshold).context("invalid --threshold"),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build a template snapshot from <dir>/<label>/<images>
    Enroll {
        /// Root directory, one subdirectory per identity
        dir: PathBuf,
        /// Snapshot to write
        #[arg(short, long, default_value = DEFAULT_DB)]
        out: PathBuf,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Derive a decision threshold from cross-identity distances
    Calibrate {
        #[arg(long, default_value = DEFAULT_DB)]
        db: PathBuf,
        /// Low percentile of the pairwise distance distribution
        #[arg(long, default_value_t = DEFAULT_PERCENTILE)]
        percentile: f32,
        /// Safety margin subtracted from the percentile value
        #[arg(long, default_value_t = DEFAULT_MARGIN)]
        margin: f32,
        /// Write the threshold as TOML for wardend / --threshold-file
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// List the identities in a template snapshot
    Inspect {
        #[arg(long, default_value = DEFAULT_DB)]
        db: PathBuf,
    },
    /// Match a single image file against a snapshot
    Check {
        image: PathBuf,
        #[arg(long, default_value = DEFAULT_DB)]
        db: PathBuf,
        #[command(flatten)]
        threshold: ThresholdArgs,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Live camera loop with terminal preview and intruder alerts
    Watch {
        /// V4L2 device path
        #[arg(long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
        #[arg(long, default_value = DEFAULT_DB)]
        db: PathBuf,
        #[command(flatten)]
        threshold: ThresholdArgs,
        /// Directory for intruder snapshots
        #[arg(long, default_value = "intruder")]
        evidence_dir: PathBuf,
        /// Minimum seconds between intruder snapshots
        #[arg(long, default_value_t = 5)]
        cooldown: u64,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// List V4L2 capture devices
    Devices,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll { dir, out, model } => cmd_enroll(&dir, &out, &model),
        Commands::Calibrate {
            db,
            percentile,
            margin,
            out,
            json,
        } => cmd_calibrate(&db, CalibrationParams { percentile, margin }, out.as_deref(), json),
        Commands::Inspect { db } => cmd_inspect(&db),
        Commands::Check {
            image,
            db,
            threshold,
            model,
        } => cmd_check(&image, &db, &threshold, &model),
        Commands::Watch {
            device,
            width,
            height,
            db,
            threshold,
            evidence_dir,
            cooldown,
            model,
        } => {
            let alerts = AlertController::new(&evidence_dir, Duration::from_secs(cooldown))
                .with_context(|| format!("failed to prepare {}", evidence_dir.display()))?;
            cmd_watch(&device, width, height, &db, &threshold, alerts, &model)
        }
        Commands::Devices => cmd_devices(),
    }
}

fn load_db(path: &Path) -> Result<TemplateDatabase> {
    TemplateDatabase::load(path).with_context(|| format!("failed to load template snapshot {}", path.display()))
}

fn cmd_enroll(dir: &Path, out: &Path, model: &ModelArgs) -> Result<()> {
    let sets = enroll::scan_identity_dirs(dir)?;
    let images: usize = sets.values().map(Vec::len).sum();
    println!("Enrolling {} identities from {images} images in {}", sets.len(), dir.display());

    let mut provider = model.load_provider()?;
    let enrollment = match enroll::build(&mut provider, &sets) {
        Ok(e) => e,
        Err(EnrollError::EnrollmentEmpty { warnings }) => {
            for w in &warnings {
                eprintln!("warning: {w}");
            }
            bail!("no identity produced a usable template; nothing written");
        }
        Err(e) => return Err(e.into()),
    };

    for identity in enrollment.database.identities() {
        println!("  {:<24} {} samples", identity.label, identity.sample_count);
    }
    for w in &enrollment.warnings {
        eprintln!("warning: {w}");
    }

    enrollment
        .database
        .save(out)
        .with_context(|| format!("failed to write {}", out.display()))?;
    println!(
        "Wrote {} identities ({}-dim) to {}",
        enrollment.database.len(),
        enrollment.database.dim(),
        out.display()
    );
    Ok(())
}

fn cmd_calibrate(db_path: &Path, params: CalibrationParams, out: Option<&Path>, json: bool) -> Result<()> {
    let db = load_db(db_path)?;
    let calibration = warden_core::calibrate(&db, params)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&calibration)?);
    } else {
        let s = &calibration.stats;
        println!("Identities:        {}", db.len());
        println!("Pairs:             {}", s.pairs);
        println!("Distance min:      {:.4}", s.min);
        println!("Distance mean:     {:.4}", s.mean);
        println!("Distance max:      {:.4}", s.max);
        println!("P{:<5}             {:.4}", params.percentile, s.percentile_value);
        println!("Margin:            {:.4}", params.margin);
        println!("Threshold:         {:.4}", calibration.threshold.value);
    }

    if let Some(path) = out {
        calibration.threshold.save(path)?;
        if !json {
            println!("Saved threshold to {}", path.display());
        }
    }
    Ok(())
}

fn cmd_inspect(db_path: &Path) -> Result<()> {
    let db = load_db(db_path)?;
    println!("{}: {} identities, {}-dim templates", db_path.display(), db.len(), db.dim());
    for (i, identity) in db.identities().iter().enumerate() {
        println!(
            "  [{i:>3}] {:<24} samples={:<4} model={}",
            identity.label,
            identity.sample_count,
            identity.template.model_version.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn cmd_check(image: &Path, db_path: &Path, threshold: &ThresholdArgs, model: &ModelArgs) -> Result<()> {
    let db = load_db(db_path)?;
    let threshold = threshold.resolve()?;
    let bytes = std::fs::read(image).with_context(|| format!("failed to read {}", image.display()))?;

    let mut provider = model.load_provider()?;
    let result = warden_core::recognize(&mut provider, &bytes, &db, threshold)
        .with_context(|| format!("cannot classify {}", image.display()))?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn cmd_watch(
    device: &str,
    width: u32,
    height: u32,
    db_path: &Path,
    threshold: &ThresholdArgs,
    alerts: AlertController,
    model: &ModelArgs,
) -> Result<()> {
    let db = Arc::new(load_db(db_path)?);
    let threshold = threshold.resolve()?;
    let provider = model.load_provider()?;

    let camera = Camera::open(device, width, height)?;
    let session = camera.start_session(4)?;
    let sink = preview::TerminalSink::new().context("failed to set up terminal")?;

    let summary = CaptureLoop::new(session, provider, sink, db, threshold, Arc::new(alerts)).run();

    println!(
        "{} frames: {} matched, {} strangers, {} without a face, {} alerts written",
        summary.frames, summary.matched, summary.strangers, summary.no_face, summary.alerts_written
    );
    match summary.stop {
        StopReason::Operator => Ok(()),
        StopReason::Failed(e) => Err(e.into()),
    }
}

fn cmd_devices() -> Result<()> {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found.");
        return Ok(());
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}
