use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tryon_core::asset::MeshRole;
use tryon_core::{
    AssetLoader, FaceMeasurements, GltfLoader, LandmarkDetector, MaterialOverrides, OverlayAsset,
};
use tryon_session::{Config, Session, SessionBackends, SessionStatus};

#[derive(Parser)]
#[command(name = "tryon", about = "Eyewear virtual try-on")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a try-on session against the camera
    Run {
        /// Product id from the catalog
        #[arg(short, long, default_value = "glasses1")]
        product: String,
        /// Stop after this many processed frames (default: until Ctrl-C)
        #[arg(short, long)]
        frames: Option<u64>,
        /// Save a PNG capture before exiting
        #[arg(short, long)]
        capture: bool,
        /// Size multiplier (0.6 - 1.5)
        #[arg(short, long, default_value_t = 1.0)]
        size: f32,
        /// Print the final session snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// List catalog products
    Products {
        #[arg(long)]
        json: bool,
    },
    /// List capture-capable V4L2 devices
    Devices,
    /// Load an eyewear asset and print how its meshes are classified
    Inspect {
        /// Path to a .glb file
        asset: PathBuf,
        /// Apply this product's mesh overrides
        #[arg(short, long)]
        product: Option<String>,
    },
    /// Run the landmark detector once on an image
    Detect {
        /// Image file (any format the image crate reads)
        image: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            product,
            frames,
            capture,
            size,
            json,
        } => run(&product, frames, capture, size, json).await?,
        Commands::Products { json } => {
            let products = tryon_core::list_products();
            if json {
                println!("{}", serde_json::to_string_pretty(products)?);
            } else {
                for p in products {
                    println!(
                        "{:<14} {:<22} {} (scale {}, offset {})",
                        p.id, p.name, p.model, p.scale, p.offset_y
                    );
                }
            }
        }
        Commands::Devices => {
            let devices = tryon_hw::camera::V4lCamera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for d in devices {
                println!("{}  {} [{}] {}", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Inspect { asset, product } => inspect(&asset, product.as_deref())?,
        Commands::Detect { image } => detect(&image)?,
    }

    Ok(())
}

async fn run(
    product: &str,
    frames: Option<u64>,
    capture: bool,
    size: f32,
    json: bool,
) -> Result<()> {
    let config = Config::from_env();
    let interval = config.frame_interval();
    let backends = SessionBackends::system(&config);
    let mut session = Session::new(product, config, backends).context("failed to create session")?;
    session.set_size_multiplier(size);

    let mut status = session.start();
    if status == SessionStatus::Error {
        let failure = session.snapshot().failure;
        if let Some(f) = failure {
            eprintln!("{:?}: {}", f.kind, f.message);
        }
        bail!("session failed to start");
    }
    println!("session {} started: {}", session.id(), session.product().name);

    let mut processed = 0u64;
    let mut last_progress = 0u8;
    drive(interval, tokio::signal::ctrl_c(), || {
        let report = session.tick();
        if report.processed.is_some() {
            processed += 1;
        }
        if report.status != status {
            println!("status: {:?} -> {:?}", status, report.status);
            status = report.status;
        }
        match status {
            SessionStatus::Scanning => {
                let progress = session.snapshot().scan_progress;
                if progress / 10 != last_progress / 10 {
                    println!("scanning {progress}%");
                }
                last_progress = progress;
            }
            SessionStatus::Error => return false,
            _ => {}
        }
        !frames.is_some_and(|n| processed >= n)
    })
    .await;

    if capture && status == SessionStatus::Running {
        let path = session.save_capture().context("failed to save capture")?;
        println!("saved {}", path.display());
    }

    let snapshot = session.snapshot();
    session.stop();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else if let Some(stats) = snapshot.tracker {
        println!(
            "{} frames processed ({} with a face, {} dropped, {} dark)",
            processed, stats.faces, stats.dropped, stats.dark_frames
        );
    }
    if let Some(f) = snapshot.failure {
        bail!("{:?}: {}", f.kind, f.message);
    }
    Ok(())
}

/// Call `tick` every `interval` until it returns `false` or `shutdown`
/// resolves. Returns `true` when stopped by `shutdown`.
///
/// `tick` runs through `block_in_place`, so this needs the multi-threaded
/// runtime.
async fn drive<S, F>(interval: Duration, shutdown: S, mut tick: F) -> bool
where
    S: Future,
    F: FnMut() -> bool,
{
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                tracing::info!("interrupted");
                return true;
            }
            _ = ticker.tick() => {}
        }
        if !tokio::task::block_in_place(&mut tick) {
            return false;
        }
    }
}

fn inspect(path: &Path, product: Option<&str>) -> Result<()> {
    let overrides = match product {
        Some(id) => tryon_core::lookup_product(id)
            .with_context(|| format!("unknown product {id}"))?
            .overrides(),
        None => MaterialOverrides::default(),
    };
    let raw = GltfLoader
        .load(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let asset = OverlayAsset::prepare(raw, &overrides)?;

    println!(
        "{}: {:.3} x {:.3} x {:.3}",
        path.display(),
        asset.native_width,
        asset.native_height,
        asset.native_depth
    );
    for mesh in &asset.meshes {
        let role = match mesh.role {
            MeshRole::Lens => "lens",
            MeshRole::Frame => "frame",
            MeshRole::Occluder => "occluder",
        };
        println!(
            "  {:<24} {:<6} {:>6} tris  opacity {:.2}  metal {:.2}  rough {:.2}",
            mesh.name,
            role,
            mesh.triangles.len(),
            mesh.material.opacity,
            mesh.material.metalness,
            mesh.material.roughness
        );
    }
    Ok(())
}

fn detect(path: &Path) -> Result<()> {
    let config = Config::from_env();
    let img = image::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .to_rgb8();
    let (width, height) = img.dimensions();

    let mut detector = tryon_core::FaceMeshDetector::load(
        &config.locator_model_path(),
        &config.face_mesh_model_path(),
        config.tracker_config(),
    )
    .context("failed to load landmark models")?;

    let Some(lms) = detector.detect(img.as_raw(), width, height)? else {
        println!("no face detected");
        return Ok(());
    };
    let m = FaceMeasurements::from_landmarks(&lms, width, height);
    let anchor = m.anchor();
    let out = serde_json::json!({
        "landmarks": lms.len(),
        "refined": lms.is_refined(),
        "anchor": { "x": anchor.x, "y": anchor.y },
        "roll_deg": m.roll().to_degrees(),
        "temple_span_px": m.temple_span(),
        "outer_eye_span_px": m.outer_eye_span(),
        "blended_span_px": m.blended_span(&config.estimator_params().blend),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
