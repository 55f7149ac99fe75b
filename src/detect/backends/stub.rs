use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;

/// Stub backend. Replays scripted detection lists, one per call, cycling.
/// With no script it never detects anything.
#[derive(Default)]
pub struct StubBackend {
    script: Vec<Vec<Detection>>,
    calls: usize,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(script: Vec<Vec<Detection>>) -> Self {
        Self { script, calls: 0 }
    }

    /// Number of `detect` calls so far.
    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<Detection>> {
        let out = if self.script.is_empty() {
            Vec::new()
        } else {
            self.script[self.calls % self.script.len()].clone()
        };
        self.calls += 1;
        Ok(out)
    }
}
