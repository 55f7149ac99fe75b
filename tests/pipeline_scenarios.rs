use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, Result};
use image::RgbImage;

use citywatch::config::{CameraSelection, CitywatchConfig};
use citywatch::images::DEFAULT_BUCKET;
use citywatch::runner::{self, SharedServices};
use citywatch::{
    AlertRepository, BoundingBox, CameraConfig, CameraDirectory, CycleOutcome, CycleTime,
    Detection,
    DetectionAdapter, Frame, FrameSource, ImageLocation, ImageStore, InMemoryObjectStore,
    LocalFallback, NewCamera, Pipeline, PipelineOptions, Priority, RuleTable, SharedDetector,
    SqliteStore, StopSignal, StreamReader, StubBackend, ViolationMatcher,
};

fn det(label: &str, confidence: f32) -> Detection {
    Detection::new(label, confidence, BoundingBox::new(0.2, 0.2, 0.6, 0.6))
}

fn at(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
}

/// Cycle time `secs` after a fixed start; wall and monotonic clocks agree.
fn tick(secs: u64) -> CycleTime {
    static START: OnceLock<Instant> = OnceLock::new();
    CycleTime {
        wall: at(0),
        monotonic: *START.get_or_init(Instant::now),
    }
    .after(Duration::from_secs(secs))
}

fn frame(seq: u64, captured_at: SystemTime) -> Frame {
    let image = RgbImage::from_fn(32, 24, |x, y| image::Rgb([x as u8 * 7, y as u8 * 9, 64]));
    Frame::new(seq, captured_at, image)
}

fn register(store: &mut SqliteStore, name: &str, url: &str) -> Result<CameraConfig> {
    let id = store.register_camera(&NewCamera {
        name: name.to_string(),
        stream_url: url.to_string(),
        location: format!("{} crossing", name),
        latitude: Some(55.75),
        longitude: Some(37.62),
        description: None,
        active: true,
    })?;
    store.camera(id)
}

struct Fixture {
    dir: tempfile::TempDir,
    db_path: String,
    camera: CameraConfig,
    objects: InMemoryObjectStore,
}

impl Fixture {
    fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("city.db").display().to_string();
        let mut store = SqliteStore::open(&db_path)?;
        let camera = register(&mut store, "Tverskaya", "stub://tverskaya")?;
        Ok(Self {
            dir,
            db_path,
            camera,
            objects: InMemoryObjectStore::new(),
        })
    }

    fn fallback_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("public").join("violations")
    }

    fn pipeline(&self, script: Vec<Vec<Detection>>, options: PipelineOptions) -> Result<Pipeline> {
        let detector: SharedDetector = Arc::new(Mutex::new(StubBackend::scripted(script)));
        let images = ImageStore::new(
            Arc::new(self.objects.clone()),
            DEFAULT_BUCKET,
            LocalFallback::new(self.fallback_dir(), "/violations"),
        );
        Ok(Pipeline::new(
            self.camera.clone(),
            options,
            DetectionAdapter::new(detector),
            ViolationMatcher::new(RuleTable::default()),
            images,
            Box::new(SqliteStore::open(&self.db_path)?),
        ))
    }

    fn alerts(&self) -> Result<Vec<citywatch::AlertRecord>> {
        SqliteStore::open(&self.db_path)?.recent(100)
    }
}

fn every_frame() -> PipelineOptions {
    PipelineOptions {
        frame_stride: 1,
        ..PipelineOptions::default()
    }
}

#[test]
fn scenario_a_car_raises_parking_alert() -> Result<()> {
    let fx = Fixture::new()?;
    let mut pipeline = fx.pipeline(vec![vec![det("car", 0.9)]], every_frame())?;

    let outcome = pipeline.process_frame(&frame(1, at(0)), tick(0));
    assert!(matches!(outcome, CycleOutcome::Alerted { .. }));

    let alerts = fx.alerts()?;
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0].alert;
    assert_eq!(alert.title, "Неправильная парковка");
    assert_eq!(alert.priority, Priority::Low);
    assert_eq!(alert.law_reference, "КоАП РФ Статья 12.19");
    assert_eq!(alert.status, citywatch::AlertStatus::New);
    assert_eq!(alert.source, "CAMERA");
    assert_eq!(alert.camera_id, fx.camera.id);
    assert_eq!(alert.location, "Tverskaya crossing");
    assert_eq!(alert.created_at, at(0));
    Ok(())
}

#[test]
fn scenario_b_second_frame_inside_interval_is_suppressed() -> Result<()> {
    let fx = Fixture::new()?;
    let detector = Arc::new(Mutex::new(StubBackend::scripted(vec![vec![det("car", 0.9)]])));
    let shared: SharedDetector = detector.clone();
    let mut pipeline = Pipeline::new(
        fx.camera.clone(),
        every_frame(),
        DetectionAdapter::new(shared),
        ViolationMatcher::new(RuleTable::default()),
        ImageStore::new(
            Arc::new(fx.objects.clone()),
            DEFAULT_BUCKET,
            LocalFallback::new(fx.fallback_dir(), "/violations"),
        ),
        Box::new(SqliteStore::open(&fx.db_path)?),
    );

    assert!(matches!(
        pipeline.process_frame(&frame(1, at(0)), tick(0)),
        CycleOutcome::Alerted { .. }
    ));
    assert_eq!(
        pipeline.process_frame(&frame(2, at(2)), tick(2)),
        CycleOutcome::Throttled
    );
    assert_eq!(fx.alerts()?.len(), 1);
    // Suppressed before detection ran.
    let calls = detector.lock().map_err(|_| anyhow!("poisoned"))?.calls();
    assert_eq!(calls, 1);
    Ok(())
}

#[test]
fn scenario_c_low_confidence_is_ignored() -> Result<()> {
    let fx = Fixture::new()?;
    let mut pipeline = fx.pipeline(vec![vec![det("car", 0.4)]], every_frame())?;
    assert_eq!(
        pipeline.process_frame(&frame(1, at(0)), tick(0)),
        CycleOutcome::NoViolation { detections: 1 }
    );
    assert!(fx.alerts()?.is_empty());
    assert_eq!(fx.objects.object_count(), 0);
    Ok(())
}

#[test]
fn scenario_d_store_outage_uses_local_fallback() -> Result<()> {
    let fx = Fixture::new()?;
    fx.objects.set_unreachable(true);
    let mut pipeline = fx.pipeline(vec![vec![det("person", 0.8)]], every_frame())?;

    let outcome = pipeline.process_frame(&frame(1, at(0)), tick(0));
    let CycleOutcome::Alerted { image, .. } = outcome else {
        return Err(anyhow!("expected an alert, got {:?}", outcome));
    };
    assert_eq!(image.location, ImageLocation::LocalFallback);

    let alerts = fx.alerts()?;
    assert_eq!(alerts.len(), 1);
    let url = &alerts[0].alert.image_url;
    assert!(url.starts_with("/violations/camera_"));
    let filename = url.trim_start_matches("/violations/");
    let bytes = std::fs::read(fx.fallback_dir().join(filename))?;
    assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    Ok(())
}

#[test]
fn uploaded_image_is_byte_identical() -> Result<()> {
    let fx = Fixture::new()?;
    let mut pipeline = fx.pipeline(vec![vec![det("garbage", 0.95)]], every_frame())?;
    let captured = frame(1, at(0));
    let CycleOutcome::Alerted { image, .. } = pipeline.process_frame(&captured, tick(0)) else {
        return Err(anyhow!("expected an alert"));
    };
    assert_eq!(image.location, ImageLocation::ObjectStore);
    assert_eq!(
        fx.objects.fetch_url(&image.url)?,
        captured.encode_jpeg(citywatch::frame::DEFAULT_JPEG_QUALITY)?
    );
    assert_eq!(fx.alerts()?[0].alert.priority, Priority::Medium);
    Ok(())
}

#[test]
fn alerts_never_closer_than_interval() -> Result<()> {
    let fx = Fixture::new()?;
    let mut pipeline = fx.pipeline(vec![vec![det("car", 0.9)]], every_frame())?;
    for secs in 0..=45 {
        pipeline.process_frame(&frame(secs + 1, at(secs)), tick(secs));
    }
    let mut times: Vec<SystemTime> = fx.alerts()?.iter().map(|r| r.alert.created_at).collect();
    times.sort();
    assert_eq!(times, vec![at(0), at(10), at(20), at(30), at(40)]);
    for pair in times.windows(2) {
        assert!(pair[1].duration_since(pair[0])? >= Duration::from_secs(10));
    }
    Ok(())
}

#[test]
fn wall_clock_step_back_does_not_reopen_interval() -> Result<()> {
    let fx = Fixture::new()?;
    let mut pipeline = fx.pipeline(vec![vec![det("car", 0.9)]], every_frame())?;

    let alerted = tick(100);
    assert!(matches!(
        pipeline.process_frame(&frame(1, alerted.wall), alerted),
        CycleOutcome::Alerted { .. }
    ));

    // NTP steps the wall clock back 5 s; only milliseconds really pass.
    let stepped = CycleTime {
        wall: alerted.wall - Duration::from_secs(5),
        monotonic: alerted.monotonic + Duration::from_millis(20),
    };
    assert_eq!(
        pipeline.process_frame(&frame(2, stepped.wall), stepped),
        CycleOutcome::Throttled
    );
    assert_eq!(fx.alerts()?.len(), 1);

    let later = CycleTime {
        wall: stepped.wall + Duration::from_secs(10),
        monotonic: alerted.monotonic + Duration::from_secs(10),
    };
    assert!(matches!(
        pipeline.process_frame(&frame(3, later.wall), later),
        CycleOutcome::Alerted { .. }
    ));
    assert_eq!(fx.alerts()?.len(), 2);
    Ok(())
}

#[test]
fn one_alert_per_frame_for_first_qualifying_detection() -> Result<()> {
    let fx = Fixture::new()?;
    let options = PipelineOptions {
        frame_stride: 1,
        min_alert_interval: Duration::ZERO,
        ..PipelineOptions::default()
    };
    let frame_detections = vec![
        det("bicycle", 0.99),
        det("car", 0.45),
        det("person", 0.7),
        det("car", 0.9),
    ];
    let mut pipeline = fx.pipeline(vec![frame_detections], options)?;
    pipeline.process_frame(&frame(1, at(0)), tick(0));

    let alerts = fx.alerts()?;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert.title, "Нарушение общественного порядка");
    assert_eq!(
        alerts[0].alert.description,
        "Обнаружено: person с вероятностью 70%"
    );
    Ok(())
}

#[test]
fn stride_admits_one_in_k_frames() -> Result<()> {
    let fx = Fixture::new()?;
    let options = PipelineOptions {
        frame_stride: 7,
        ..PipelineOptions::default()
    };
    let mut pipeline = fx.pipeline(vec![vec![]], options)?;
    for seq in 1..=70 {
        pipeline.process_frame(&frame(seq, at(seq)), tick(seq));
    }
    assert_eq!(pipeline.stats().frames_analyzed, 10);
    Ok(())
}

/// Source that fails a scripted number of reads between good frames.
struct FlakySource {
    reads: VecDeque<bool>,
    connects: Arc<Mutex<u32>>,
}

impl FrameSource for FlakySource {
    fn connect(&mut self) -> Result<()> {
        *self.connects.lock().map_err(|_| anyhow!("poisoned"))? += 1;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        match self.reads.pop_front() {
            Some(false) => Err(anyhow!("rtsp read timeout")),
            _ => Ok(Some(RgbImage::new(16, 16))),
        }
    }

    fn disconnect(&mut self) {}

    fn locator(&self) -> &str {
        "stub://flaky"
    }
}

#[test]
fn reconnect_keeps_throttle_state() -> Result<()> {
    let fx = Fixture::new()?;
    let mut pipeline = fx.pipeline(vec![vec![det("car", 0.9)]], every_frame())?;
    let connects = Arc::new(Mutex::new(0));
    let source = FlakySource {
        reads: vec![true, false, false, false, true, true].into(),
        connects: connects.clone(),
    };
    let mut stream = StreamReader::new(Box::new(source), Duration::ZERO);
    stream.open()?;
    let stop = StopSignal::new();

    let first = stream.read_frame(&stop).ok_or_else(|| anyhow!("no frame"))?;
    assert!(matches!(
        pipeline.process_frame(&first, tick(0)),
        CycleOutcome::Alerted { .. }
    ));

    // Three failed reads, then the stream recovers on its own.
    let second = stream.read_frame(&stop).ok_or_else(|| anyhow!("no frame"))?;
    assert_eq!(second.seq, 2);
    assert_eq!(stream.stats().reconnects, 3);
    assert_eq!(stream.stats().frames_this_connection, 1);
    assert_eq!(*connects.lock().map_err(|_| anyhow!("poisoned"))?, 4);
    assert_eq!(pipeline.process_frame(&second, tick(3)), CycleOutcome::Throttled);

    let third = stream.read_frame(&stop).ok_or_else(|| anyhow!("no frame"))?;
    assert!(matches!(
        pipeline.process_frame(&third, tick(12)),
        CycleOutcome::Alerted { .. }
    ));
    assert_eq!(fx.alerts()?.len(), 2);

    stop.stop();
    assert!(stream.read_frame(&stop).is_none());
    Ok(())
}

fn wait_for_alerts(db_path: &str, count: usize, timeout: Duration) -> Result<usize> {
    let deadline = Instant::now() + timeout;
    let mut store = SqliteStore::open(db_path)?;
    loop {
        let found = store.recent(100)?.len();
        if found >= count || Instant::now() >= deadline {
            return Ok(found);
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

fn test_config(db_path: &str, fallback: &Path) -> Result<CitywatchConfig> {
    let mut cfg = CitywatchConfig::load_from(None)?;
    cfg.db_path = db_path.to_string();
    cfg.camera = CameraSelection::AllActive;
    cfg.pipeline.frame_stride = 1;
    cfg.fallback.dir = fallback.to_path_buf();
    cfg.validate()?;
    Ok(cfg)
}

#[test]
fn all_cameras_run_in_parallel_workers() -> Result<()> {
    let fx = Fixture::new()?;
    {
        let mut store = SqliteStore::open(&fx.db_path)?;
        register(&mut store, "Arbat", "stub://arbat")?;
    }
    let cfg = test_config(&fx.db_path, &fx.fallback_dir())?;

    let mut directory = SqliteStore::open(&fx.db_path)?;
    let cameras = runner::select_cameras(&cfg, &mut directory)?;
    assert_eq!(cameras.len(), 2);

    let services = SharedServices {
        detector: Arc::new(Mutex::new(StubBackend::scripted(vec![vec![det("car", 0.9)]]))),
        object_store: Arc::new(fx.objects.clone()),
    };
    let stop = StopSignal::new();
    let worker_stop = stop.clone();
    let worker_cfg = cfg.clone();
    let handle = std::thread::spawn(move || {
        runner::run_cameras(&worker_cfg, cameras, &services, &worker_stop)
    });

    let found = wait_for_alerts(&fx.db_path, 2, Duration::from_secs(10))?;
    stop.stop();
    let stats = handle
        .join()
        .map_err(|_| anyhow!("runner panicked"))??;

    assert_eq!(found, 2);
    assert_eq!(stats.len(), 2);
    // Each worker throttles on its own; one alert per camera inside the interval.
    for s in &stats {
        assert_eq!(s.alerts_created, 1);
    }
    let mut camera_ids: Vec<i64> = fx.alerts()?.iter().map(|r| r.alert.camera_id).collect();
    camera_ids.sort();
    camera_ids.dedup();
    assert_eq!(camera_ids.len(), 2);
    Ok(())
}

#[test]
fn missing_camera_is_a_startup_failure() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("empty.db").display().to_string();
    let mut cfg = test_config(&db_path, &dir.path().join("violations"))?;
    cfg.camera = CameraSelection::FirstActive;
    assert!(runner::run(&cfg, &StopSignal::new()).is_err());

    cfg.camera = CameraSelection::Id(42);
    let mut directory = SqliteStore::open(&db_path)?;
    assert!(runner::select_cameras(&cfg, &mut directory).is_err());
    Ok(())
}

#[cfg(not(feature = "rtsp-gstreamer"))]
#[test]
fn network_locator_needs_gstreamer() -> Result<()> {
    let fx = Fixture::new()?;
    let mut store = SqliteStore::open(&fx.db_path)?;
    let camera = register(&mut store, "Remote", "rtsp://10.0.0.5/stream")?;
    let cfg = test_config(&fx.db_path, &fx.fallback_dir())?;
    assert!(runner::open_stream(&cfg, &camera).is_err());
    Ok(())
}
