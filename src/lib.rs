//! Foresight aerial-surveillance pipeline
//!
//! This crate implements the live analytics core for search-and-rescue and monitoring
//! flights: a video feed is ingested, objects are detected and given persistent
//! identities, each object's ground position is estimated from the camera pose, and the
//! annotated result is republished to many concurrent viewers.
//!
//! # Architecture
//!
//! One tick of the pipeline runs strictly downstream:
//!
//! 1. **Source**: `VideoSource::next_frame` (RTSP/UDP via GStreamer, or synthetic).
//! 2. **Detect**: `Detector::infer` (ONNX backend or deterministic synthetic backend).
//! 3. **Track**: `Tracker::update` assigns identities by greedy IOU association.
//! 4. **Geolocate**: `GeoEstimator::estimate` projects each box center to lat/lon.
//! 5. **Annotate**: `Annotator::annotate` applies privacy blur, then boxes and labels.
//! 6. **Encode**: `FrameEncoder::encode` compresses the rendered frame.
//! 7. **Publish**: the whole result is swapped in as one immutable `Snapshot`.
//!
//! The `Snapshot` is the only state shared between the worker and its readers (the
//! HTTP API and the telemetry `Broadcaster`). Readers always observe a frame and a
//! detection list produced by the same tick.
//!
//! # Module Structure
//!
//! - `frame`: Owned pixel frames (`Frame`, `FrameRead`)
//! - `ingest`: Video sources
//! - `detect`: Detector capability and backends
//! - `track`, `geo`, `annotate`, `codec`: per-tick stages
//! - `pipeline`: `PipelineRunner`, snapshot publication, runtime controls
//! - `broadcast`: periodic telemetry fan-out
//! - `api`: HTTP request layer
//! - Core types: `BBox`, `Detection`, `GeoPoint`, `CameraPose`, `Mode`

use serde::{Deserialize, Serialize};

pub mod annotate;
pub mod api;
pub mod broadcast;
pub mod codec;
pub mod config;
pub mod detect;
pub mod frame;
pub mod geo;
pub mod ingest;
pub mod pipeline;
pub mod track;

pub use annotate::{Annotator, DetectionSummary, FaceLocator, LabelFont};
pub use api::{ApiConfig, ApiHandle, ApiServer};
pub use broadcast::{Broadcaster, ChannelSink, EventStreamSink, TelemetrySink};
pub use codec::{FrameEncoder, JpegCodec};
pub use config::{DetectorConfig, ForesightConfig};
pub use detect::{Detector, DetectorBackend, DetectorOutput, DetectorStatus, SyntheticBackend};
pub use frame::{Frame, FrameRead};
pub use geo::{GeoEstimator, GEO_ERROR_PLACEHOLDER_M};
pub use ingest::{RtspConfig, RtspSource, SyntheticSource, VideoSource};
pub use pipeline::{
    Controls, GeoTrack, Health, PipelineRunner, PipelineState, RunnerOptions, Snapshot,
    SnapshotCell, Stages,
};
pub use track::{iou, Track, Tracker, TrackerConfig};

// -------------------- Bounding Boxes --------------------

/// Axis-aligned box in pixel coordinates (`x1,y1` top-left, `x2,y2` bottom-right).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Clamp the box into a `width` x `height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let w = width as f32;
        let h = height as f32;
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }

    pub fn as_array(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

// -------------------- Detections --------------------

/// One object found by a detector in one frame.
///
/// Confidence is clamped into `0..=1` at construction; fields are read-only afterwards.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    bbox: BBox,
    confidence: f32,
    class_label: String,
}

impl Detection {
    pub fn new(bbox: BBox, confidence: f32, class_label: impl Into<String>) -> Self {
        Self {
            bbox,
            confidence: clamp_confidence(confidence),
            class_label: class_label.into(),
        }
    }

    pub fn bbox(&self) -> BBox {
        self.bbox
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn class_label(&self) -> &str {
        &self.class_label
    }
}

pub(crate) fn clamp_confidence(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

// -------------------- Geolocation --------------------

/// Estimated ground position of a tracked object for the current tick.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
    /// Ground level under the flat-ground model.
    pub altitude_m: f64,
    /// Placeholder uncertainty, not a measured accuracy.
    pub error_m: f64,
}

/// Camera position and orientation used for ground projection.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraPose {
    pub lat: f64,
    pub lon: f64,
    /// Height above ground in meters.
    pub altitude_m: f64,
    /// Depression angle of the optical axis below the horizon.
    pub pitch_deg: f64,
    /// Compass heading of the optical axis (0 = north, 90 = east).
    pub yaw_deg: f64,
    /// Horizontal field of view.
    pub fov_deg: f64,
}

impl Default for CameraPose {
    fn default() -> Self {
        Self {
            lat: 6.1164,
            lon: 125.1716,
            altitude_m: 35.0,
            pitch_deg: 60.0,
            yaw_deg: 0.0,
            fov_deg: 78.0,
        }
    }
}

/// Partial pose update; absent fields keep their current value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseUpdate {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub altitude_m: Option<f64>,
    pub pitch_deg: Option<f64>,
    pub yaw_deg: Option<f64>,
    pub fov_deg: Option<f64>,
}

impl CameraPose {
    pub fn apply(&mut self, update: &PoseUpdate) {
        if let Some(lat) = update.lat {
            self.lat = lat;
        }
        if let Some(lon) = update.lon {
            self.lon = lon;
        }
        if let Some(altitude_m) = update.altitude_m {
            self.altitude_m = altitude_m;
        }
        if let Some(pitch_deg) = update.pitch_deg {
            self.pitch_deg = pitch_deg;
        }
        if let Some(yaw_deg) = update.yaw_deg {
            self.yaw_deg = yaw_deg;
        }
        if let Some(fov_deg) = update.fov_deg {
            self.fov_deg = fov_deg;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(-90.0..=90.0).contains(&self.lat) {
            anyhow::bail!("pose lat must be within [-90, 90], got {}", self.lat);
        }
        if !(-180.0..=180.0).contains(&self.lon) {
            anyhow::bail!("pose lon must be within [-180, 180], got {}", self.lon);
        }
        if !(self.altitude_m >= 0.0) {
            anyhow::bail!("pose altitude must be >= 0, got {}", self.altitude_m);
        }
        if !(self.fov_deg > 0.0 && self.fov_deg < 180.0) {
            anyhow::bail!("pose fov must be within (0, 180), got {}", self.fov_deg);
        }
        if !self.pitch_deg.is_finite() || !self.yaw_deg.is_finite() {
            anyhow::bail!("pose pitch and yaw must be finite");
        }
        Ok(())
    }
}

// -------------------- Modes --------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Sar,
    Suspect,
}

impl Mode {
    /// Parse a mode name. Unrecognized values fall back to `Sar`.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("suspect") {
            Mode::Suspect
        } else {
            Mode::Sar
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Sar => "sar",
            Mode::Suspect => "suspect",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_confidence_is_clamped() {
        let bbox = BBox::new(0.0, 0.0, 10.0, 10.0);
        assert_eq!(Detection::new(bbox, 1.7, "person").confidence(), 1.0);
        assert_eq!(Detection::new(bbox, -0.2, "person").confidence(), 0.0);
        assert_eq!(Detection::new(bbox, f32::NAN, "person").confidence(), 0.0);
        assert_eq!(Detection::new(bbox, 0.42, "person").confidence(), 0.42);
    }

    #[test]
    fn unknown_modes_default_to_sar() {
        assert_eq!(Mode::parse("suspect"), Mode::Suspect);
        assert_eq!(Mode::parse(" SUSPECT "), Mode::Suspect);
        assert_eq!(Mode::parse("sar"), Mode::Sar);
        assert_eq!(Mode::parse("lockdown"), Mode::Sar);
        assert_eq!(Mode::parse(""), Mode::Sar);
    }

    #[test]
    fn pose_update_is_partial() {
        let mut pose = CameraPose::default();
        pose.apply(&PoseUpdate {
            yaw_deg: Some(90.0),
            altitude_m: Some(50.0),
            ..PoseUpdate::default()
        });
        assert_eq!(pose.yaw_deg, 90.0);
        assert_eq!(pose.altitude_m, 50.0);
        assert_eq!(pose.lat, CameraPose::default().lat);
    }

    #[test]
    fn pose_validation_rejects_out_of_range() {
        let mut pose = CameraPose::default();
        assert!(pose.validate().is_ok());
        pose.lat = 91.0;
        assert!(pose.validate().is_err());
        pose = CameraPose {
            fov_deg: 0.0,
            ..CameraPose::default()
        };
        assert!(pose.validate().is_err());
    }
}
