//! Detector capability.
//!
//! `Detector` is chosen once at construction: either a real inference backend or the
//! deterministic synthetic backend. It is never switched at call time. When the
//! inference backend fails on a frame, `infer` substitutes an empty detection set and
//! reports `DetectorStatus::Degraded` so the tick still publishes a well-formed snapshot.

mod backend;
mod backends;
pub mod labels;
mod nms;

pub use backend::{DetectionCapability, DetectorBackend};
pub use backends::SyntheticBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use nms::non_max_suppression;

use serde::Serialize;

use crate::config::DetectorConfig;
use crate::frame::Frame;
use crate::Detection;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorStatus {
    /// Real inference ran on this frame.
    Live,
    /// The synthetic backend produced this frame's detections.
    Synthetic,
    /// Inference failed on this frame; an empty set was substituted.
    Degraded,
}

impl DetectorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorStatus::Live => "live",
            DetectorStatus::Synthetic => "synthetic",
            DetectorStatus::Degraded => "degraded",
        }
    }
}

#[derive(Debug)]
pub struct DetectorOutput {
    pub detections: Vec<Detection>,
    pub status: DetectorStatus,
    /// Backend error message when `status` is `Degraded`.
    pub failure: Option<String>,
}

pub enum Detector {
    Inference(Box<dyn DetectorBackend>),
    Synthetic(SyntheticBackend),
}

impl Detector {
    pub fn synthetic() -> Self {
        Detector::Synthetic(SyntheticBackend::new())
    }

    pub fn inference<B: DetectorBackend + 'static>(backend: B) -> Self {
        Detector::Inference(Box::new(backend))
    }

    /// Build the detector named by configuration.
    ///
    /// No model path selects the synthetic backend. A model that cannot be loaded is
    /// logged and also falls back to synthetic; the choice is fixed from then on.
    pub fn from_config(config: &DetectorConfig) -> Self {
        let Some(path) = config.model_path.as_ref() else {
            log::info!("detector: no model configured, using synthetic backend");
            return Self::synthetic();
        };

        #[cfg(feature = "backend-tract")]
        {
            let loaded = TractBackend::new(path, config.input_size).map(|backend| {
                backend.with_thresholds(config.confidence, config.iou)
            });
            match loaded {
                Ok(mut backend) => {
                    if let Err(e) = backend.warm_up() {
                        log::warn!("detector: warm-up failed: {:#}", e);
                    }
                    log::info!("detector: loaded {}", path.display());
                    return Self::inference(backend);
                }
                Err(e) => {
                    log::error!(
                        "detector: model {} unavailable ({:#}); using synthetic backend",
                        path.display(),
                        e
                    );
                    return Self::synthetic();
                }
            }
        }

        #[cfg(not(feature = "backend-tract"))]
        {
            log::error!(
                "detector: model {} configured but built without backend-tract; using synthetic backend",
                path.display()
            );
            Self::synthetic()
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Detector::Inference(backend) => backend.name(),
            Detector::Synthetic(backend) => backend.name(),
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, Detector::Synthetic(_))
    }

    /// Run detection on one frame. Never fails; see `DetectorStatus`.
    pub fn infer(&mut self, frame: &Frame) -> DetectorOutput {
        match self {
            Detector::Synthetic(backend) => {
                let detections = backend
                    .detect(frame.pixels(), frame.width, frame.height)
                    .unwrap_or_default();
                DetectorOutput {
                    detections,
                    status: DetectorStatus::Synthetic,
                    failure: None,
                }
            }
            Detector::Inference(backend) => {
                match backend.detect(frame.pixels(), frame.width, frame.height) {
                    Ok(detections) => DetectorOutput {
                        detections,
                        status: DetectorStatus::Live,
                        failure: None,
                    },
                    Err(e) => DetectorOutput {
                        detections: Vec::new(),
                        status: DetectorStatus::Degraded,
                        failure: Some(format!("{:#}", e)),
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};

    struct FailingBackend;

    impl DetectorBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn supports(&self, _capability: DetectionCapability) -> bool {
            true
        }

        fn detect(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<Detection>> {
            Err(anyhow!("runtime exploded"))
        }
    }

    #[test]
    fn inference_failure_degrades_to_empty_set() {
        let mut detector = Detector::inference(FailingBackend);
        let frame = Frame::solid(8, 8, [0, 0, 0], 0).unwrap();
        let out = detector.infer(&frame);

        assert_eq!(out.status, DetectorStatus::Degraded);
        assert!(out.detections.is_empty());
        assert!(out.failure.unwrap().contains("runtime exploded"));
    }

    #[test]
    fn missing_model_selects_synthetic() {
        let detector = Detector::from_config(&DetectorConfig::default());
        assert!(detector.is_synthetic());
        assert_eq!(detector.name(), "synthetic");
    }

    #[test]
    fn synthetic_detector_reports_synthetic_status() {
        let mut detector = Detector::synthetic();
        let frame = Frame::solid(640, 360, [36, 36, 36], 0).unwrap();
        let out = detector.infer(&frame);
        assert_eq!(out.status, DetectorStatus::Synthetic);
        assert_eq!(out.detections.len(), 1);
    }
}
