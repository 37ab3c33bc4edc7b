use anyhow::Result;

use crate::Detection;

/// What a backend is able to locate.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionCapability {
    /// General object classes (people, vehicles, animals, ...).
    ObjectDetection,
    /// Faces only. Used for privacy masking, never for identification.
    FaceDetection,
}

/// Detector backend trait.
///
/// A backend receives one RGB8 frame by reference and returns pixel-space detections.
/// Implementations must treat the pixel slice as read-only and must not retain it
/// beyond the `detect` call.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend supports a capability.
    fn supports(&self, capability: DetectionCapability) -> bool;

    /// Run detection on a packed RGB8 frame.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
