#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{imageops, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::labels::coco_label;
use crate::detect::result::{BoundingBox, Detection};

/// Tract backend for SSD-MobileNet style ONNX detectors.
///
/// Expects a `uint8[1, H, W, 3]` input and the four standard outputs in order:
/// `detection_boxes [1, N, 4]`, `detection_classes [1, N]`,
/// `detection_scores [1, N]`, `num_detections [1]`. Frames are resized to the
/// model input size before inference; boxes come back normalized, so no
/// rescaling is needed afterwards.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    u8::datum_type(),
                    tvec!(1, height as usize, width as usize, 3),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
        })
    }

    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<Tensor> {
        let frame = RgbImage::from_raw(width, height, pixels.to_vec())
            .ok_or_else(|| anyhow!("expected {}x{} RGB pixels, got {} bytes", width, height, pixels.len()))?;
        let resized = if width == self.width && height == self.height {
            frame
        } else {
            imageops::resize(&frame, self.width, self.height, imageops::FilterType::Triangle)
        };
        let input = tract_ndarray::Array4::from_shape_vec(
            (1, self.height as usize, self.width as usize, 3),
            resized.into_raw(),
        )
        .context("shape model input")?;
        Ok(input.into_tensor())
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        let input = self.build_input(pixels, width, height)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        if outputs.len() < 4 {
            return Err(anyhow!("expected 4 model outputs, got {}", outputs.len()));
        }

        let boxes = outputs[0]
            .to_array_view::<f32>()
            .context("detection_boxes was not f32")?;
        let classes = outputs[1]
            .to_array_view::<f32>()
            .context("detection_classes was not f32")?;
        let scores = outputs[2]
            .to_array_view::<f32>()
            .context("detection_scores was not f32")?;
        let count = outputs[3]
            .to_array_view::<f32>()
            .context("num_detections was not f32")?
            .iter()
            .next()
            .copied()
            .unwrap_or(0.0);

        let boxes: Vec<f32> = boxes.iter().copied().collect();
        let n = (count.max(0.0) as usize)
            .min(scores.len())
            .min(classes.len())
            .min(boxes.len() / 4);

        let mut out = Vec::with_capacity(n);
        for (i, (class, score)) in classes.iter().zip(scores.iter()).take(n).enumerate() {
            let Some(label) = coco_label(*class as i64) else {
                continue;
            };
            let b = &boxes[i * 4..i * 4 + 4];
            out.push(Detection::new(
                label,
                *score,
                BoundingBox::new(b[0], b[1], b[2], b[3]),
            ));
        }
        Ok(out)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = vec![0u8; (self.width * self.height * 3) as usize];
        self.detect(&blank, self.width, self.height)
            .map(|_| ())
            .context("model warm-up inference failed")
    }
}
