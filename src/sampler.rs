//! Frame admission: stride gate plus post-alert cool-down.

use std::time::{Duration, Instant, SystemTime};

pub const DEFAULT_FRAME_STRIDE: u64 = 30;
pub const DEFAULT_MIN_ALERT_INTERVAL: Duration = Duration::from_secs(10);

/// When a pipeline cycle runs.
///
/// `wall` stamps alerts and object keys. `monotonic` drives the cool-down, so
/// a wall-clock step (NTP, manual change) cannot shorten or stretch it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleTime {
    pub wall: SystemTime,
    pub monotonic: Instant,
}

impl CycleTime {
    pub fn now() -> Self {
        Self {
            wall: SystemTime::now(),
            monotonic: Instant::now(),
        }
    }

    /// Same instant on both clocks, shifted by `by`.
    pub fn after(self, by: Duration) -> Self {
        Self {
            wall: self.wall + by,
            monotonic: self.monotonic + by,
        }
    }
}

/// Last-alert time for one camera worker.
///
/// Owned by the pipeline; never shared between workers. Survives stream
/// reconnects.
#[derive(Clone, Debug)]
pub struct ThrottleState {
    last_alert: Option<CycleTime>,
    min_interval: Duration,
}

impl ThrottleState {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_alert: None,
            min_interval,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wall-clock time of the last recorded alert.
    pub fn last_alert(&self) -> Option<SystemTime> {
        self.last_alert.map(|at| at.wall)
    }

    /// True while less than `min_interval` of monotonic time has passed since
    /// the last alert. The wall clock is not consulted.
    pub fn in_cooldown(&self, now: CycleTime) -> bool {
        let Some(last) = self.last_alert else {
            return false;
        };
        now.monotonic.saturating_duration_since(last.monotonic) < self.min_interval
    }

    pub fn record_alert(&mut self, at: CycleTime) {
        self.last_alert = Some(at);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Not a stride frame.
    Stride,
    /// Inside the post-alert cool-down; detection is not run.
    Throttled,
}

/// Decides which frames reach detection.
#[derive(Clone, Debug)]
pub struct FrameSampler {
    stride: u64,
}

impl FrameSampler {
    /// `stride` of 0 is treated as 1 (every frame).
    pub fn new(stride: u64) -> Self {
        Self {
            stride: stride.max(1),
        }
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Frame sequence numbers start at 1; frames `K, 2K, 3K, ...` pass the
    /// stride gate.
    pub fn check(&self, frame_seq: u64, now: CycleTime, throttle: &ThrottleState) -> Admission {
        if frame_seq % self.stride != 0 {
            return Admission::Stride;
        }
        if throttle.in_cooldown(now) {
            return Admission::Throttled;
        }
        Admission::Admitted
    }

    pub fn admit(&self, frame_seq: u64, now: CycleTime, throttle: &ThrottleState) -> bool {
        self.check(frame_seq, now, throttle) == Admission::Admitted
    }
}

impl Default for FrameSampler {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_STRIDE)
    }
}
