use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facewatch_core::{ArcFaceEmbedder, DetectorChoice, DetectorSelector, OnnxDetectorFactory};
use facewatch_engine::{Backends, PipelineSettings, Preset, RecognitionEngine};
use facewatch_hw::{Camera, FrameSource};
use facewatch_store::FaceStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

mod enroll;

/// How often the display side polls the frame queue.
const POLL_INTERVAL: Duration = Duration::from_millis(16);
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "facewatch", about = "Real-time face recognition from a local camera")]
struct Cli {
    /// TOML settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Tuning preset: fast, balanced or cctv
    #[arg(short, long, global = true)]
    preset: Option<Preset>,
    /// Override the database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run live recognition until interrupted
    Run {
        /// Camera index (0 → /dev/video0)
        #[arg(long)]
        camera: Option<u32>,
        /// Detector strategy: auto, fast, gpu or accurate
        #[arg(long)]
        detector: Option<DetectorChoice>,
        /// Match tolerance; also sets the distance threshold to tolerance + 0.05
        #[arg(long)]
        tolerance: Option<f32>,
        /// Save the last annotated frame here on exit
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Enroll a new identity from the camera
    Enroll {
        /// Display name for this person
        #[arg(short, long)]
        name: String,
        #[arg(long)]
        camera: Option<u32>,
        /// Frames to try before giving up
        #[arg(long, default_value_t = 60)]
        max_frames: usize,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove {
        /// Identity ID to remove
        id: String,
    },
    /// Show recent recognition events
    Logs {
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },
    /// Show gallery size and resolved settings
    Status,
    /// Run camera diagnostics
    Test {
        #[arg(long)]
        camera: Option<u32>,
        /// Frames to capture for the throughput measurement
        #[arg(long, default_value_t = 60)]
        frames: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut settings = PipelineSettings::load(cli.config.as_deref(), cli.preset)?;
    if let Some(db) = cli.db {
        settings.db_path = db;
    }

    match cli.command {
        Commands::Run {
            camera,
            detector,
            tolerance,
            snapshot,
        } => {
            if let Some(detector) = detector {
                settings.detector = detector;
            }
            if let Some(tolerance) = tolerance {
                settings = settings.with_tolerance(tolerance);
            }
            let camera = camera.unwrap_or(settings.camera_index);
            run(settings, camera, snapshot).await?;
        }
        Commands::Enroll {
            name,
            camera,
            max_frames,
        } => {
            let camera = camera.unwrap_or(settings.camera_index);
            let store = open_store(&settings)?;
            if store.find_by_name(&name)?.is_some() {
                bail!("{name:?} is already enrolled");
            }
            println!("Enrolling {name}: look at the camera...");
            let record = tokio::task::spawn_blocking(move || -> Result<_> {
                let mut source = Camera::open_index(camera)?;
                let mut active = DetectorSelector::new(OnnxDetectorFactory)
                    .select(settings.detector, &settings.detector_config());
                let mut embedder = ArcFaceEmbedder::load(&settings.arcface_model_path())?;
                enroll::capture_identity(
                    &mut source,
                    active.detector.as_mut(),
                    &mut embedder,
                    &name,
                    max_frames,
                )
            })
            .await??;

            if !store.add(&record)? {
                bail!("{:?} is already enrolled", record.display_name);
            }
            println!("Enrolled {} ({})", record.display_name, record.identity_id);
            println!("{} registered", store.count()?);
        }
        Commands::List => {
            let store = open_store(&settings)?;
            let records = store.load_all()?;
            for r in &records {
                println!(
                    "{}  {:<24} enrolled {}",
                    r.identity_id,
                    r.display_name,
                    r.enrolled_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            println!("{} registered", records.len());
        }
        Commands::Remove { id } => {
            let store = open_store(&settings)?;
            if !store.delete(&id)? {
                bail!("no identity with id {id}");
            }
            println!("Removed {id}");
            println!("{} registered", store.count()?);
        }
        Commands::Logs { limit } => {
            let store = open_store(&settings)?;
            let events = store.query_events(limit)?;
            if events.is_empty() {
                println!("No recognition events");
            }
            for e in &events {
                println!(
                    "{}  {:<24} {}",
                    e.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                    e.display_name,
                    if e.matched { "registered" } else { "unregistered" }
                );
            }
        }
        Commands::Status => {
            let store = open_store(&settings)?;
            let status = serde_json::json!({
                "identities": store.count()?,
                "detector": settings.detector.to_string(),
                "settings": settings,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Test { camera, frames } => {
            let camera = camera.unwrap_or(settings.camera_index);
            tokio::task::spawn_blocking(move || camera_diagnostics(camera, frames)).await??;
        }
    }

    Ok(())
}

fn open_store(settings: &PipelineSettings) -> Result<Arc<FaceStore>> {
    let store = FaceStore::open(&settings.db_path)
        .with_context(|| format!("opening {}", settings.db_path.display()))?;
    Ok(Arc::new(store))
}

/// Run a live session, printing the overlay status until Ctrl-C.
async fn run(settings: PipelineSettings, camera: u32, snapshot: Option<PathBuf>) -> Result<()> {
    let store = open_store(&settings)?;
    let mut engine = RecognitionEngine::new(Backends::hardware(store), settings.clone());
    tokio::task::block_in_place(|| engine.start(camera, settings))?;

    if let Some(active) = engine.active_detector() {
        println!(
            "Watching camera {camera} with {} detector ({}), {} identities",
            active.kind.display_name(),
            active.reason,
            engine.gallery().len()
        );
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut last_status: Option<Instant> = None;
    let mut latest = None;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => {
                if let Some(frame) = engine.poll_frame() {
                    if last_status.map_or(true, |t| t.elapsed() >= STATUS_INTERVAL) {
                        let labels: Vec<&str> = frame.faces.iter().map(|f| f.label.as_str()).collect();
                        println!("{}  [{}]", frame.status_line(), labels.join(", "));
                        last_status = Some(Instant::now());
                    }
                    latest = Some(frame);
                }
                if !engine.is_running() {
                    tracing::warn!("session ended unexpectedly");
                    break;
                }
            }
        }
    }

    tokio::task::block_in_place(|| engine.stop());

    if let (Some(path), Some(frame)) = (snapshot, latest) {
        frame
            .image
            .save(&path)
            .with_context(|| format!("saving snapshot to {}", path.display()))?;
        println!("Saved snapshot to {}", path.display());
    }
    Ok(())
}

fn camera_diagnostics(index: u32, frames: usize) -> Result<()> {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in &devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    let mut camera = Camera::open_index(index)?;
    let (width, height) = camera.resolution();
    println!(
        "Opened {} at {width}x{height} ({:?})",
        camera.device_path, camera.fourcc
    );

    let start = Instant::now();
    let mut brightness = 0.0f32;
    let mut captured = 0usize;
    for _ in 0..frames {
        match camera.read_frame() {
            Ok(frame) => {
                brightness += frame.avg_brightness();
                captured += 1;
            }
            Err(e) => println!("capture error: {e}"),
        }
    }
    let elapsed = start.elapsed().as_secs_f32();

    if captured == 0 {
        bail!("no frames captured from camera {index}");
    }
    println!(
        "Captured {captured}/{frames} frames in {elapsed:.2}s ({:.1} fps), mean brightness {:.1}",
        captured as f32 / elapsed,
        brightness / captured as f32
    );
    Ok(())
}
