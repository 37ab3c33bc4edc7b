//! Atomically published tick results.
//!
//! The worker builds a complete `Snapshot` off to the side and swaps it in with one
//! pointer store. Readers clone the `Arc` and keep a self-consistent view for as long
//! as they like; the write lock is held only for the swap.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use serde::Serialize;

use crate::annotate::DetectionSummary;
use crate::detect::DetectorStatus;
use crate::track::Track;
use crate::{GeoPoint, Mode};

/// A track with its ground position for one tick.
#[derive(Clone, Debug, PartialEq)]
pub struct GeoTrack {
    pub track: Track,
    pub geo: GeoPoint,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrameStats {
    pub fps: f64,
    pub latency_ms: f64,
    pub mean_geo_error_m: f64,
    pub detector: DetectorStatus,
    pub faces_blurred: usize,
}

/// The complete, immutable result of one published tick.
#[derive(Debug)]
pub struct Snapshot {
    /// Published-tick counter, starting at 1.
    pub tick: u64,
    /// Sequence number of the source frame this tick rendered.
    pub frame_sequence: u64,
    pub published_at: Instant,
    pub width: u32,
    pub height: u32,
    pub frame: Arc<[u8]>,
    pub content_type: &'static str,
    pub stats: FrameStats,
    pub tracks: Vec<GeoTrack>,
    pub detections: Vec<DetectionSummary>,
    pub mode: Mode,
    pub blur_enabled: bool,
}

impl Snapshot {
    pub fn age_ms(&self) -> u64 {
        self.published_at.elapsed().as_millis() as u64
    }
}

/// Single-writer, many-reader slot holding the latest snapshot.
#[derive(Debug, Default)]
pub struct SnapshotCell {
    slot: RwLock<Option<Arc<Snapshot>>>,
}

impl SnapshotCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the published snapshot in its entirety.
    pub fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Arc::clone(&snapshot));
        snapshot
    }

    /// The latest snapshot, or `None` before the first publish.
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn latest_tick(&self) -> u64 {
        self.latest().map_or(0, |snapshot| snapshot.tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(tick: u64) -> Snapshot {
        Snapshot {
            tick,
            frame_sequence: tick,
            published_at: Instant::now(),
            width: 1,
            height: 1,
            frame: Arc::from(vec![tick as u8]),
            content_type: "image/jpeg",
            stats: FrameStats {
                fps: 0.0,
                latency_ms: 0.0,
                mean_geo_error_m: 2.5,
                detector: DetectorStatus::Synthetic,
                faces_blurred: 0,
            },
            tracks: Vec::new(),
            detections: Vec::new(),
            mode: Mode::Sar,
            blur_enabled: false,
        }
    }

    #[test]
    fn readers_keep_their_view_across_publishes() {
        let cell = SnapshotCell::new();
        assert!(cell.latest().is_none());
        assert_eq!(cell.latest_tick(), 0);

        cell.publish(snapshot(1));
        let held = cell.latest().unwrap();
        cell.publish(snapshot(2));

        assert_eq!(held.tick, 1);
        assert_eq!(&held.frame[..], &[1]);
        assert_eq!(cell.latest_tick(), 2);
    }
}
