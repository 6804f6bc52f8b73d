#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{BackendDetection, DetectorBackend};
use crate::detect::result::{BoundingBox, ObjectClass};

/// COCO class index for `cat`, used by the SSD-style detection models this
/// backend expects.
const COCO_CAT_CLASS: i64 = 16;

/// Tract-based neural backend.
///
/// Loads a local SSD-style ONNX detection model (boxes, classes, scores
/// outputs; normalized box coordinates) tuned for constrained devices:
/// reduced input resolution and quantization-friendly weights. Frames are
/// resized to the model input with nearest-neighbor sampling before
/// inference; output boxes are mapped back to frame coordinates.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    input_width: u32,
    input_height: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_width: u32, input_height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_height as usize, input_width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_width,
            input_height,
        })
    }

    /// Resize to model input with nearest-neighbor sampling and convert to
    /// normalized NCHW float.
    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<Tensor> {
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }

        let (iw, ih) = (self.input_width as usize, self.input_height as usize);
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, ih, iw), |(_, c, y, x)| {
            let src_x = x * width as usize / iw;
            let src_y = y * height as usize / ih;
            let idx = (src_y * width as usize + src_x) * 3 + c;
            pixels[idx] as f32 / 255.0
        });

        Ok(input.into_tensor())
    }

    fn parse_outputs(
        &self,
        outputs: &TVec<TValue>,
        frame_width: u32,
        frame_height: u32,
    ) -> Result<Vec<BackendDetection>> {
        if outputs.len() < 3 {
            return Err(anyhow!(
                "model produced {} outputs, expected boxes/classes/scores",
                outputs.len()
            ));
        }

        let boxes_view = outputs[0]
            .to_array_view::<f32>()
            .context("boxes output was not f32")?;
        let classes_view = outputs[1]
            .to_array_view::<f32>()
            .context("classes output was not f32")?;
        let scores_view = outputs[2]
            .to_array_view::<f32>()
            .context("scores output was not f32")?;

        let boxes: Vec<f32> = boxes_view.iter().copied().collect();
        let classes: Vec<f32> = classes_view.iter().copied().collect();
        let scores: Vec<f32> = scores_view.iter().copied().collect();

        if boxes.len() != scores.len() * 4 || classes.len() < scores.len() {
            return Err(anyhow!(
                "model output shape mismatch: {} box floats, {} classes, {} scores",
                boxes.len(),
                classes.len(),
                scores.len()
            ));
        }

        let mut detections = Vec::new();
        for (i, &score) in scores.iter().enumerate() {
            // [ymin, xmin, ymax, xmax], normalized.
            let ymin = boxes[i * 4].clamp(0.0, 1.0);
            let xmin = boxes[i * 4 + 1].clamp(0.0, 1.0);
            let ymax = boxes[i * 4 + 2].clamp(0.0, 1.0);
            let xmax = boxes[i * 4 + 3].clamp(0.0, 1.0);
            if xmax <= xmin || ymax <= ymin {
                continue;
            }

            let x = (xmin * frame_width as f32) as i32;
            let y = (ymin * frame_height as f32) as i32;
            let w = ((xmax - xmin) * frame_width as f32) as u32;
            let h = ((ymax - ymin) * frame_height as f32) as u32;

            detections.push(BackendDetection {
                bbox: BoundingBox::new(x, y, w, h, score),
                class: if classes[i] as i64 == COCO_CAT_CLASS {
                    ObjectClass::Cat
                } else {
                    ObjectClass::Other
                },
            });
        }
        Ok(detections)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<BackendDetection>> {
        let input = self.build_input(pixels, width, height)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.parse_outputs(&outputs, width, height)
    }
}
