//! citywatch: camera violation monitoring.
//!
//! Watches live camera streams, samples frames for object detection, and
//! turns qualifying detections into deduplicated violation alerts with a
//! stored image.
//!
//! # Pipeline
//!
//! ```text
//! CameraDirectory -> StreamReader -> FrameSampler -> DetectionAdapter
//!     -> ViolationMatcher -> ImageStore + AlertRepository -> ThrottleState
//! ```
//!
//! # Module Structure
//!
//! - `ingest`: stream sources and the reconnecting `StreamReader`
//! - `sampler`: stride gate and per-camera alert throttle
//! - `detect`: detector backends and the confidence-floor adapter
//! - `violation`: rule table and first-match selection
//! - `images`: object store upload with local fallback
//! - `storage`: SQLite camera directory and alert repository
//! - `pipeline`: the per-camera orchestrator
//! - `runner`: configuration to running workers

pub mod alert;
pub mod config;
pub mod detect;
pub mod frame;
pub mod images;
pub mod ingest;
pub mod pipeline;
pub mod runner;
pub mod sampler;
pub mod signal;
pub mod storage;
pub mod violation;

pub use alert::{describe_detection, AlertRecord, AlertStatus, NewAlert, ALERT_SOURCE_CAMERA};
pub use config::{CameraSelection, CitywatchConfig};
pub use detect::{
    open_backend, BoundingBox, Detection, DetectionAdapter, DetectorBackend, DetectorSettings,
    SharedDetector, StubBackend,
};
pub use frame::Frame;
pub use images::{
    ImageLocation, ImageStore, InMemoryObjectStore, LocalFallback, ObjectStore, S3Config,
    S3ObjectStore, StoredImage,
};
pub use ingest::{FrameSource, RtspConfig, RtspSource, StreamReader, StreamState, StreamStats};
pub use pipeline::{CycleOutcome, Pipeline, PipelineOptions, PipelineStats, ThrottleCommit};
pub use sampler::{Admission, CycleTime, FrameSampler, ThrottleState};
pub use signal::StopSignal;
pub use storage::{
    AlertRepository, CameraConfig, CameraDirectory, InMemoryAlertRepository, NewCamera,
    SqliteStore,
};
pub use violation::{Priority, RuleTable, ViolationMatch, ViolationMatcher, ViolationRule};
