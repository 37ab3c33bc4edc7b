#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::labels::{coco_labels, label_for};
use crate::detect::nms::non_max_suppression;
use crate::frame::rgb_len;
use crate::{BBox, Detection};

/// Letterbox fill value (YOLO convention).
const PAD_VALUE: f32 = 114.0 / 255.0;

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// Expects a `[1, 3, S, S]` input and a `[1, 4 + classes, anchors]` output of
/// `cx, cy, w, h` followed by per-class scores. Frames are letterboxed into the top-left
/// of the square input; boxes are scaled back into frame pixels.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    labels: Vec<String>,
    capability: DetectionCapability,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an object detector with COCO labels.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        Self::load(
            model_path.as_ref(),
            input_size,
            coco_labels(),
            DetectionCapability::ObjectDetection,
        )
    }

    /// Load a single-class face detector for privacy masking.
    pub fn face<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        Self::load(
            model_path.as_ref(),
            input_size,
            vec!["face".to_string()],
            DetectionCapability::FaceDetection,
        )
    }

    fn load(
        model_path: &Path,
        input_size: u32,
        labels: Vec<String>,
        capability: DetectionCapability,
    ) -> Result<Self> {
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)))
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            labels,
            capability,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
        })
    }

    /// Override the default confidence and NMS thresholds.
    pub fn with_thresholds(mut self, confidence: f32, iou: f32) -> Self {
        self.confidence_threshold = confidence;
        self.iou_threshold = iou;
        self
    }

    /// Letterbox the frame into the model input. Returns the tensor and the scale ratio.
    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<(Tensor, f32)> {
        let expected_len = rgb_len(width, height)?;
        if pixels.len() != expected_len {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                expected_len,
                pixels.len()
            ));
        }
        if width == 0 || height == 0 {
            return Err(anyhow!("empty frame"));
        }

        let side = self.input_size as f32;
        let ratio = (side / width as f32).min(side / height as f32);
        let scaled_w = ((width as f32 * ratio).round() as u32).clamp(1, self.input_size);
        let scaled_h = ((height as f32 * ratio).round() as u32).clamp(1, self.input_size);

        let source = RgbImage::from_raw(width, height, pixels.to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", width, height))?;
        let resized = image::imageops::resize(&source, scaled_w, scaled_h, FilterType::Triangle);

        let side = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, channel, y, x)| {
            if x < scaled_w as usize && y < scaled_h as usize {
                resized.get_pixel(x as u32, y as u32).0[channel] as f32 / 255.0
            } else {
                PAD_VALUE
            }
        });

        Ok((input.into_tensor(), ratio))
    }

    fn decode(&self, outputs: TVec<TValue>, ratio: f32, width: u32, height: u32) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let preds = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("detector output must be rank 3")?;
        let (_, rows, anchors) = preds.dim();
        if rows < 5 {
            return Err(anyhow!("detector output has only {} rows per anchor", rows));
        }

        let mut detections = Vec::new();
        for anchor in 0..anchors {
            let mut best_class = 0usize;
            let mut best_score = f32::NEG_INFINITY;
            for row in 4..rows {
                let score = preds[[0, row, anchor]];
                if score > best_score {
                    best_score = score;
                    best_class = row - 4;
                }
            }
            if !(best_score >= self.confidence_threshold) {
                continue;
            }

            let cx = preds[[0, 0, anchor]] / ratio;
            let cy = preds[[0, 1, anchor]] / ratio;
            let w = preds[[0, 2, anchor]] / ratio;
            let h = preds[[0, 3, anchor]] / ratio;
            let bbox = BBox::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
                .clamp_to(width, height);
            if bbox.area() <= 0.0 {
                continue;
            }
            detections.push(Detection::new(
                bbox,
                best_score,
                label_for(best_class, &self.labels),
            ));
        }

        non_max_suppression(&mut detections, self.iou_threshold);
        Ok(detections)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        match self.capability {
            DetectionCapability::FaceDetection => "tract-face",
            _ => "tract",
        }
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        capability == self.capability
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        let (input, ratio) = self.build_input(pixels, width, height)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, ratio, width, height)
    }

    fn warm_up(&mut self) -> Result<()> {
        let side = self.input_size;
        let blank = vec![0u8; rgb_len(side, side)?];
        self.detect(&blank, side, side).map(|_| ())
    }
}
