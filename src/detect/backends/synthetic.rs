use anyhow::Result;

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::{BBox, Detection};

const BOX_WIDTH: f32 = 120.0;
const BOX_HEIGHT: f32 = 200.0;
const CONFIDENCE: f32 = 0.76;
const STEP_PX: u64 = 6;

/// Deterministic stand-in for a real model.
///
/// Emits one `person` box that walks left to right across the frame, advancing a fixed
/// step per call. Output depends only on the call count and frame size, so a pipeline
/// fed by it keeps a single stable track id.
#[derive(Debug, Default)]
pub struct SyntheticBackend {
    calls: u64,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The box emitted on call number `index` for a `width` x `height` frame.
    pub fn box_at(index: u64, width: u32, height: u32) -> Option<BBox> {
        let w = width as f32;
        let h = height as f32;
        if w < BOX_WIDTH || h < BOX_HEIGHT {
            return None;
        }
        let travel = (w - BOX_WIDTH).max(1.0) as u64;
        let x1 = ((index * STEP_PX) % travel) as f32;
        let y1 = ((h - BOX_HEIGHT) / 2.0).floor();
        Some(BBox::new(x1, y1, x1 + BOX_WIDTH, y1 + BOX_HEIGHT))
    }
}

impl DetectorBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::ObjectDetection)
    }

    fn detect(&mut self, _pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        let index = self.calls;
        self.calls += 1;
        Ok(Self::box_at(index, width, height)
            .map(|bbox| vec![Detection::new(bbox, CONFIDENCE, "person")])
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::iou;

    #[test]
    fn synthetic_backend_walks_one_person() {
        let mut backend = SyntheticBackend::new();
        let first = backend.detect(&[], 640, 360).unwrap();
        let second = backend.detect(&[], 640, 360).unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].class_label(), "person");
        assert_eq!(first[0].confidence(), CONFIDENCE);
        assert_eq!(second[0].bbox().x1 - first[0].bbox().x1, STEP_PX as f32);
        // Consecutive boxes overlap enough to keep one identity.
        assert!(iou(&first[0].bbox(), &second[0].bbox()) > 0.9);
    }

    #[test]
    fn tiny_frames_yield_nothing() {
        let mut backend = SyntheticBackend::new();
        assert!(backend.detect(&[], 64, 64).unwrap().is_empty());
    }
}
