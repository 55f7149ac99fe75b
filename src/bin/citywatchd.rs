//! citywatchd - camera violation monitoring daemon
//!
//! This daemon:
//! 1. Loads configuration (file, `CITYWATCH_*` environment, flags)
//! 2. Looks up the camera(s) to watch in the database
//! 3. Loads the detector and connects to the object store
//! 4. Runs one capture/detect/throttle/persist worker per camera until Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use citywatch::{runner, CameraSelection, CitywatchConfig, StopSignal};

#[derive(Parser, Debug)]
#[command(author, version, about = "Camera violation monitoring daemon")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "CITYWATCH_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Minimum seconds between two alerts from one camera.
    #[arg(long, value_name = "SECS")]
    interval: Option<u64>,

    /// Run detection on every Nth frame.
    #[arg(long)]
    stride: Option<u64>,

    /// Seconds to wait before reconnecting a failed stream.
    #[arg(long, value_name = "SECS")]
    backoff_secs: Option<u64>,

    /// Watch this camera instead of the first active one.
    #[arg(long, conflicts_with = "all_cameras")]
    camera_id: Option<i64>,

    /// Watch every active camera, one worker each.
    #[arg(long)]
    all_cameras: bool,

    /// SQLite database holding cameras and alerts.
    #[arg(long, value_name = "PATH")]
    db_path: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = CitywatchConfig::load_from(args.config.as_deref())?;
    if let Some(secs) = args.interval {
        cfg.pipeline.min_alert_interval = Duration::from_secs(secs);
    }
    if let Some(stride) = args.stride {
        cfg.pipeline.frame_stride = stride;
    }
    if let Some(secs) = args.backoff_secs {
        cfg.pipeline.reconnect_backoff = Duration::from_secs(secs);
    }
    if let Some(id) = args.camera_id {
        cfg.camera = CameraSelection::Id(id);
    }
    if args.all_cameras {
        cfg.camera = CameraSelection::AllActive;
    }
    if let Some(db_path) = args.db_path {
        cfg.db_path = db_path;
    }
    cfg.validate()?;

    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received, stopping camera workers...");
        handler_stop.stop();
    })
    .expect("error setting Ctrl-C handler");

    log::info!(
        "citywatchd {} starting. database {}",
        env!("CARGO_PKG_VERSION"),
        cfg.db_path
    );
    log::info!(
        "min alert interval {:?}, stride {}, reconnect backoff {:?}, throttle on {}",
        cfg.pipeline.min_alert_interval,
        cfg.pipeline.frame_stride,
        cfg.pipeline.reconnect_backoff,
        cfg.pipeline.throttle_commit
    );

    let stats = runner::run(&cfg, &stop)?;
    let alerts: u64 = stats.iter().map(|s| s.alerts_created).sum();
    let failed: u64 = stats.iter().map(|s| s.alerts_failed).sum();
    log::info!(
        "citywatchd stopped: {} alerts created, {} failed",
        alerts,
        failed
    );
    Ok(())
}
