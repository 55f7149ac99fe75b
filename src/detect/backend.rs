use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::detect::result::Detection;

/// Detector shared by camera workers. `detect` takes `&mut self`, so access
/// is serialised through the mutex.
pub type SharedDetector = Arc<Mutex<dyn DetectorBackend>>;

/// Object-detection capability.
///
/// Backends return every candidate they produce; confidence filtering is the
/// adapter's job. The pixel slice is packed RGB8 and must not be retained
/// beyond the call.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once at startup. A failure is a startup failure.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
