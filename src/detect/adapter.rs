use crate::detect::backend::{DetectorBackend, SharedDetector};
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Candidates at or below this confidence are dropped before matching.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.3;

/// Normalizes backend output for the pipeline.
///
/// A backend error, a poisoned backend lock, or malformed output for one frame
/// yields an empty list and a warning. Nothing here can fail the worker.
pub struct DetectionAdapter {
    detector: SharedDetector,
    min_confidence: f32,
}

impl DetectionAdapter {
    pub fn new(detector: SharedDetector) -> Self {
        Self {
            detector,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn min_confidence(&self) -> f32 {
        self.min_confidence
    }

    /// Detections above the floor, in backend order.
    pub fn detect(&self, frame: &Frame) -> Vec<Detection> {
        let raw = {
            let mut backend = match self.detector.lock() {
                Ok(guard) => guard,
                Err(_) => {
                    log::warn!("frame {}: detector lock poisoned, skipping", frame.seq);
                    return Vec::new();
                }
            };
            match backend.detect(frame.pixels(), frame.width(), frame.height()) {
                Ok(raw) => raw,
                Err(e) => {
                    log::warn!(
                        "frame {}: detection with {} failed: {:#}",
                        frame.seq,
                        backend.name(),
                        e
                    );
                    return Vec::new();
                }
            }
        };

        let total = raw.len();
        let kept: Vec<Detection> = raw
            .into_iter()
            .filter(|d| is_well_formed(d) && d.confidence > self.min_confidence)
            .collect();
        log::debug!(
            "frame {}: {} detections, {} above {:.2}",
            frame.seq,
            total,
            kept.len(),
            self.min_confidence
        );
        kept
    }
}

fn is_well_formed(detection: &Detection) -> bool {
    let ok = !detection.label.trim().is_empty()
        && detection.confidence.is_finite()
        && (0.0..=1.0).contains(&detection.confidence)
        && detection.bbox.is_finite();
    if !ok {
        log::debug!("dropping malformed detection {:?}", detection);
    }
    ok
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::SystemTime;

    use anyhow::anyhow;
    use image::RgbImage;

    use super::*;
    use crate::detect::backend::DetectorBackend;
    use crate::detect::backends::StubBackend;
    use crate::detect::result::BoundingBox;

    fn frame() -> Frame {
        Frame::new(30, SystemTime::now(), RgbImage::new(4, 4))
    }

    fn adapter_for(detections: Vec<Detection>) -> DetectionAdapter {
        let backend: SharedDetector = Arc::new(Mutex::new(StubBackend::scripted(vec![detections])));
        DetectionAdapter::new(backend)
    }

    struct FailingBackend;

    impl DetectorBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn detect(&mut self, _pixels: &[u8], _w: u32, _h: u32) -> anyhow::Result<Vec<Detection>> {
            Err(anyhow!("model returned garbage"))
        }
    }

    #[test]
    fn applies_confidence_floor_and_keeps_order() {
        let adapter = adapter_for(vec![
            Detection::new("person", 0.31, BoundingBox::default()),
            Detection::new("car", 0.3, BoundingBox::default()),
            Detection::new("dog", 0.1, BoundingBox::default()),
            Detection::new("car", 0.9, BoundingBox::new(0.1, 0.2, 0.3, 0.4)),
        ]);
        let out = adapter.detect(&frame());
        let labels: Vec<_> = out.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["person", "car"]);
        assert_eq!(out[1].bbox, BoundingBox::new(0.1, 0.2, 0.3, 0.4));
        assert_eq!(out[1].confidence, 0.9);
    }

    #[test]
    fn configured_floor_replaces_default() {
        let adapter = adapter_for(vec![
            Detection::new("person", 0.45, BoundingBox::default()),
            Detection::new("car", 0.55, BoundingBox::default()),
        ]);
        assert_eq!(adapter.min_confidence(), DEFAULT_MIN_CONFIDENCE);

        let adapter = adapter.with_min_confidence(0.5);
        assert_eq!(adapter.min_confidence(), 0.5);
        let labels: Vec<_> = adapter
            .detect(&frame())
            .into_iter()
            .map(|d| d.label)
            .collect();
        assert_eq!(labels, vec!["car"]);
    }

    #[test]
    fn drops_malformed_detections() {
        let adapter = adapter_for(vec![
            Detection::new("car", f32::NAN, BoundingBox::default()),
            Detection::new("car", 1.7, BoundingBox::default()),
            Detection::new("", 0.9, BoundingBox::default()),
            Detection::new("car", 0.9, BoundingBox::new(f32::INFINITY, 0.0, 1.0, 1.0)),
            Detection::new("bus", 0.8, BoundingBox::default()),
        ]);
        let out = adapter.detect(&frame());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].label, "bus");
    }

    #[test]
    fn backend_failure_yields_no_detections() {
        let backend: SharedDetector = Arc::new(Mutex::new(FailingBackend));
        let adapter = DetectionAdapter::new(backend);
        assert!(adapter.detect(&frame()).is_empty());
    }
}
