use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::backend::{DetectorBackend, SharedDetector};
use super::backends::StubBackend;

/// Which detector to load and how.
#[derive(Clone, Debug)]
pub struct DetectorSettings {
    /// `stub` or `tract`.
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: "stub".to_string(),
            model_path: None,
            input_width: 300,
            input_height: 300,
        }
    }
}

/// Load and warm up the configured backend.
///
/// Any failure here is a startup failure: the daemon exits without entering
/// the run loop.
pub fn open_backend(settings: &DetectorSettings) -> Result<SharedDetector> {
    let detector: SharedDetector = match settings.backend.as_str() {
        "stub" => {
            log::warn!("using stub detector: no violations will be detected");
            Arc::new(Mutex::new(StubBackend::new()))
        }
        "tract" => open_tract(settings)?,
        other => return Err(anyhow!("unknown detector backend '{}'", other)),
    };
    {
        let mut backend = detector
            .lock()
            .map_err(|_| anyhow!("detector lock poisoned"))?;
        backend.warm_up()?;
        log::info!("detector '{}' loaded", backend.name());
    }
    Ok(detector)
}

#[cfg(feature = "backend-tract")]
fn open_tract(settings: &DetectorSettings) -> Result<SharedDetector> {
    let path = settings
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow!("tract backend requires a model path"))?;
    let backend =
        super::backends::TractBackend::new(path, settings.input_width, settings.input_height)?;
    Ok(Arc::new(Mutex::new(backend)))
}

#[cfg(not(feature = "backend-tract"))]
fn open_tract(_settings: &DetectorSettings) -> Result<SharedDetector> {
    Err(anyhow!("tract backend requires the backend-tract feature"))
}
