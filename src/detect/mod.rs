mod adapter;
mod backend;
mod backends;
mod labels;
mod registry;
mod result;

pub use adapter::{DetectionAdapter, DEFAULT_MIN_CONFIDENCE};
pub use backend::{DetectorBackend, SharedDetector};
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use labels::coco_label;
pub use registry::{open_backend, DetectorSettings};
pub use result::{BoundingBox, Detection};
