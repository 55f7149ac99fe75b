//! Per-camera orchestrator.
//!
//! One `Pipeline` serves one camera: read, sample, detect, match, then
//! persist the image and the alert and update the throttle. Every per-frame
//! failure is contained here and reported through logs and `CycleOutcome`.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::alert::{describe_detection, AlertStatus, NewAlert, ALERT_SOURCE_CAMERA};
use crate::detect::DetectionAdapter;
use crate::frame::Frame;
use crate::images::{ImageLocation, ImageStore, StoredImage};
use crate::ingest::StreamReader;
use crate::sampler::{
    Admission, CycleTime, FrameSampler, ThrottleState, DEFAULT_FRAME_STRIDE,
    DEFAULT_MIN_ALERT_INTERVAL,
};
use crate::signal::StopSignal;
use crate::storage::{AlertRepository, CameraConfig};
use crate::violation::{ViolationMatch, ViolationMatcher};

pub const DEFAULT_HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// When a matched violation starts a new cool-down window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ThrottleCommit {
    /// After the persist attempt, whether or not it succeeded.
    #[default]
    OnAttempt,
    /// Only once the alert row is stored.
    OnSuccess,
}

impl ThrottleCommit {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThrottleCommit::OnAttempt => "attempt",
            ThrottleCommit::OnSuccess => "success",
        }
    }
}

impl fmt::Display for ThrottleCommit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThrottleCommit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "attempt" => Ok(ThrottleCommit::OnAttempt),
            "success" => Ok(ThrottleCommit::OnSuccess),
            other => Err(anyhow!(
                "throttle commit must be 'attempt' or 'success', got '{}'",
                other
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineOptions {
    pub frame_stride: u64,
    pub min_alert_interval: Duration,
    pub throttle_commit: ThrottleCommit,
    pub health_log_interval: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            frame_stride: DEFAULT_FRAME_STRIDE,
            min_alert_interval: DEFAULT_MIN_ALERT_INTERVAL,
            throttle_commit: ThrottleCommit::default(),
            health_log_interval: DEFAULT_HEALTH_LOG_INTERVAL,
        }
    }
}

/// Result of one pass through the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    /// Not a stride frame.
    SkippedStride,
    /// Inside the post-alert cool-down; detection was not run.
    Throttled,
    NoViolation { detections: usize },
    Alerted { alert_id: i64, image: StoredImage },
    /// A violation matched but the image or the alert row could not be stored.
    AlertFailed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_seen: u64,
    pub frames_analyzed: u64,
    pub frames_throttled: u64,
    pub violations: u64,
    pub alerts_created: u64,
    pub alerts_failed: u64,
    pub image_fallbacks: u64,
}

pub struct Pipeline {
    camera: CameraConfig,
    sampler: FrameSampler,
    throttle: ThrottleState,
    throttle_commit: ThrottleCommit,
    detector: DetectionAdapter,
    matcher: ViolationMatcher,
    images: ImageStore,
    alerts: Box<dyn AlertRepository>,
    health_log_interval: Duration,
    stats: PipelineStats,
}

impl Pipeline {
    pub fn new(
        camera: CameraConfig,
        options: PipelineOptions,
        detector: DetectionAdapter,
        matcher: ViolationMatcher,
        images: ImageStore,
        alerts: Box<dyn AlertRepository>,
    ) -> Self {
        Self {
            camera,
            sampler: FrameSampler::new(options.frame_stride),
            throttle: ThrottleState::new(options.min_alert_interval),
            throttle_commit: options.throttle_commit,
            detector,
            matcher,
            images,
            alerts,
            health_log_interval: options.health_log_interval,
            stats: PipelineStats::default(),
        }
    }

    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    pub fn throttle(&self) -> &ThrottleState {
        &self.throttle
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Run one frame through the pipeline at `now`.
    pub fn process_frame(&mut self, frame: &Frame, now: CycleTime) -> CycleOutcome {
        self.stats.frames_seen += 1;
        match self.sampler.check(frame.seq, now, &self.throttle) {
            Admission::Admitted => {}
            Admission::Stride => return CycleOutcome::SkippedStride,
            Admission::Throttled => {
                self.stats.frames_throttled += 1;
                log::debug!("camera {}: frame {} throttled", self.camera.id, frame.seq);
                return CycleOutcome::Throttled;
            }
        }

        self.stats.frames_analyzed += 1;
        let detections = self.detector.detect(frame);
        let Some(violation) = self.matcher.find_match(&detections) else {
            log::debug!(
                "camera {}: frame {} has {} detections, no violation",
                self.camera.id,
                frame.seq,
                detections.len()
            );
            return CycleOutcome::NoViolation {
                detections: detections.len(),
            };
        };
        self.stats.violations += 1;

        let outcome = self.record(frame, &violation, now);
        let stored = matches!(outcome, CycleOutcome::Alerted { .. });
        if stored || self.throttle_commit == ThrottleCommit::OnAttempt {
            self.throttle.record_alert(now);
        }
        outcome
    }

    fn record(&mut self, frame: &Frame, violation: &ViolationMatch, now: CycleTime) -> CycleOutcome {
        let image = match self.images.save(frame, self.camera.id) {
            Ok(image) => image,
            Err(e) => {
                log::error!(
                    "camera {}: dropping '{}' alert, image not stored: {:#}",
                    self.camera.id,
                    violation.rule.title,
                    e
                );
                self.stats.alerts_failed += 1;
                return CycleOutcome::AlertFailed;
            }
        };
        if image.location == ImageLocation::LocalFallback {
            self.stats.image_fallbacks += 1;
        }

        let alert = NewAlert {
            title: violation.rule.title.clone(),
            description: describe_detection(
                &violation.detection.label,
                violation.detection.confidence,
            ),
            location: self.camera.location.clone(),
            status: AlertStatus::New,
            priority: violation.rule.priority,
            law_reference: violation.rule.law_reference.clone(),
            source: ALERT_SOURCE_CAMERA.to_string(),
            image_url: image.url.clone(),
            camera_id: self.camera.id,
            created_at: now.wall,
        };
        match self.alerts.create(&alert) {
            Ok(alert_id) => {
                self.stats.alerts_created += 1;
                log::info!(
                    "camera {}: alert {} created: {} ({}, {:.2})",
                    self.camera.id,
                    alert_id,
                    alert.title,
                    violation.detection.label,
                    violation.detection.confidence
                );
                CycleOutcome::Alerted { alert_id, image }
            }
            Err(e) => {
                log::error!(
                    "camera {}: could not store '{}' alert: {:#}",
                    self.camera.id,
                    alert.title,
                    e
                );
                self.stats.alerts_failed += 1;
                CycleOutcome::AlertFailed
            }
        }
    }

    /// Drive the stream until `stop` fires. The stream is closed on return,
    /// and by its `Drop` if a stage panics.
    pub fn run(&mut self, stream: &mut StreamReader, stop: &StopSignal) -> PipelineStats {
        log::info!(
            "camera {} ({}) running: stride {}, detection floor {}, min interval {:?}, throttle on {}",
            self.camera.id,
            self.camera.location,
            self.sampler.stride(),
            self.detector.min_confidence(),
            self.throttle.min_interval(),
            self.throttle_commit
        );
        let mut last_health = Instant::now();
        while let Some(frame) = stream.read_frame(stop) {
            self.process_frame(&frame, CycleTime::now());
            if last_health.elapsed() >= self.health_log_interval {
                self.log_health(stream);
                last_health = Instant::now();
            }
        }
        stream.close();
        self.log_health(stream);
        self.stats.clone()
    }

    fn log_health(&self, stream: &StreamReader) {
        let s = stream.stats();
        log::info!(
            "camera {} health: stream={:?} healthy={} frames={} reconnects={} analyzed={} throttled={} alerts={} failed={} fallbacks={}",
            self.camera.id,
            s.state,
            stream.is_healthy(),
            s.frames_read,
            s.reconnects,
            self.stats.frames_analyzed,
            self.stats.frames_throttled,
            self.stats.alerts_created,
            self.stats.alerts_failed,
            self.stats.image_fallbacks
        );
    }
}
