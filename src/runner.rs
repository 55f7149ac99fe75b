//! Wiring from configuration to running camera workers.
//!
//! Each camera gets its own pipeline, database connection, stream and
//! throttle state. The loaded detector and the object store client are
//! shared between workers.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use crate::config::{CameraSelection, CitywatchConfig};
use crate::detect::{open_backend, DetectionAdapter, SharedDetector};
use crate::images::{ImageStore, LocalFallback, ObjectStore, S3ObjectStore};
use crate::ingest::{RtspConfig, RtspSource, StreamReader};
use crate::pipeline::{Pipeline, PipelineStats};
use crate::signal::StopSignal;
use crate::storage::{AlertRepository, CameraConfig, CameraDirectory, SqliteStore};
use crate::violation::ViolationMatcher;

/// Clients shared by every camera worker.
#[derive(Clone)]
pub struct SharedServices {
    pub detector: SharedDetector,
    pub object_store: Arc<dyn ObjectStore>,
}

impl SharedServices {
    /// Load the detector and build the object store client. A detector that
    /// fails to load is a startup failure.
    pub fn from_config(cfg: &CitywatchConfig) -> Result<Self> {
        let detector = open_backend(&cfg.detector).context("detector failed to initialize")?;
        let object_store = S3ObjectStore::new(cfg.storage.s3.clone())?;
        Ok(Self {
            detector,
            object_store: Arc::new(object_store),
        })
    }
}

/// Resolve the configured camera selection against the directory.
pub fn select_cameras(
    cfg: &CitywatchConfig,
    directory: &mut dyn CameraDirectory,
) -> Result<Vec<CameraConfig>> {
    let cameras = match cfg.camera {
        CameraSelection::FirstActive => vec![directory.first_active()?],
        CameraSelection::Id(id) => vec![directory.camera(id)?],
        CameraSelection::AllActive => directory.active_cameras()?,
    };
    if cameras.is_empty() {
        return Err(anyhow!("no active cameras found in database"));
    }
    Ok(cameras)
}

pub fn build_pipeline(
    cfg: &CitywatchConfig,
    camera: CameraConfig,
    services: &SharedServices,
    alerts: Box<dyn AlertRepository>,
) -> Result<Pipeline> {
    let detector = DetectionAdapter::new(services.detector.clone())
        .with_min_confidence(cfg.detection_min_confidence);
    let matcher =
        ViolationMatcher::new(cfg.rule_table()?).with_min_confidence(cfg.rule_min_confidence);
    let images = ImageStore::new(
        services.object_store.clone(),
        &cfg.storage.bucket,
        LocalFallback::new(&cfg.fallback.dir, &cfg.fallback.url_prefix),
    )
    .with_jpeg_quality(cfg.storage.jpeg_quality);
    Ok(Pipeline::new(
        camera,
        cfg.pipeline.options(),
        detector,
        matcher,
        images,
        alerts,
    ))
}

/// Open the camera's stream. Failing the first connect is a startup failure.
pub fn open_stream(cfg: &CitywatchConfig, camera: &CameraConfig) -> Result<StreamReader> {
    let source = RtspSource::new(RtspConfig::for_locator(&camera.stream_url))
        .with_context(|| format!("camera {}: unsupported stream", camera.id))?;
    let mut stream = StreamReader::new(Box::new(source), cfg.pipeline.reconnect_backoff);
    stream
        .open()
        .with_context(|| format!("camera {}: initial stream open failed", camera.id))?;
    Ok(stream)
}

struct Worker {
    pipeline: Pipeline,
    stream: StreamReader,
}

/// Run one worker per camera until `stop` fires.
///
/// All workers are set up before any starts, so a startup failure for any
/// camera aborts the whole run. With a single camera the worker runs on the
/// calling thread.
pub fn run_cameras(
    cfg: &CitywatchConfig,
    cameras: Vec<CameraConfig>,
    services: &SharedServices,
    stop: &StopSignal,
) -> Result<Vec<PipelineStats>> {
    let mut workers = Vec::with_capacity(cameras.len());
    for camera in cameras {
        let alerts = SqliteStore::open(&cfg.db_path)?;
        let stream = open_stream(cfg, &camera)?;
        let pipeline = build_pipeline(cfg, camera, services, Box::new(alerts))?;
        workers.push(Worker { pipeline, stream });
    }

    if workers.len() == 1 {
        let mut worker = workers.remove(0);
        return Ok(vec![worker.pipeline.run(&mut worker.stream, stop)]);
    }

    let mut handles = Vec::with_capacity(workers.len());
    for mut worker in workers {
        let camera_id = worker.pipeline.camera().id;
        let stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name(format!("camera-{}", camera_id))
            .spawn(move || worker.pipeline.run(&mut worker.stream, &stop))
            .with_context(|| format!("spawn worker for camera {}", camera_id))?;
        handles.push((camera_id, handle));
    }
    log::info!("{} camera workers running", handles.len());

    let mut stats = Vec::with_capacity(handles.len());
    for (camera_id, handle) in handles {
        match handle.join() {
            Ok(s) => stats.push(s),
            Err(_) => log::error!("camera {} worker panicked", camera_id),
        }
    }
    Ok(stats)
}

/// Select cameras, load shared services and run until stopped.
pub fn run(cfg: &CitywatchConfig, stop: &StopSignal) -> Result<Vec<PipelineStats>> {
    let cameras = {
        let mut directory = SqliteStore::open(&cfg.db_path)?;
        select_cameras(cfg, &mut directory)?
    };
    for camera in &cameras {
        log::info!(
            "watching camera {} '{}' at {} ({})",
            camera.id,
            camera.name,
            camera.location,
            camera.stream_url
        );
    }
    let services = SharedServices::from_config(cfg)?;
    run_cameras(cfg, cameras, &services, stop)
}
