//! Multi-object tracking by greedy IOU association.
//!
//! Each tick the tracker receives the full detection set for one frame. Existing tracks
//! are visited in ascending id order and each claims the unclaimed detection with the
//! highest IOU, provided it reaches the match threshold. Unclaimed detections open new
//! tracks; unmatched tracks age and are dropped once `age > max_age`.
//!
//! The association is greedy and deterministic, not globally optimal. Both sets are
//! small (tens of objects), so the O(tracks x detections) scan is fine.

use serde::{Deserialize, Serialize};

use crate::{BBox, Detection};

/// Intersection-over-Union of two boxes. Symmetric, 1 for identical non-empty boxes,
/// 0 for disjoint or degenerate boxes.
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let ix1 = a.x1.max(b.x1);
    let iy1 = a.y1.max(b.y1);
    let ix2 = a.x2.min(b.x2);
    let iy2 = a.y2.min(b.y2);
    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let union = a.area() + b.area() - inter;
    if union <= 0.0 {
        return 0.0;
    }
    (inter / union).max(0.0)
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Minimum IOU for a detection to continue an existing track.
    pub iou_threshold: f32,
    /// Ticks a track may go unmatched before removal.
    pub max_age: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            max_age: 15,
        }
    }
}

/// A persistent identity for one physical object. Only `Tracker` creates or mutates tracks.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Track {
    id: u64,
    bbox: BBox,
    confidence: f32,
    class_label: String,
    age: u32,
}

impl Track {
    pub fn id(&self) -> u64 {
        self.id
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

    /// Ticks since the last match (0 on the tick it was matched or created).
    pub fn age(&self) -> u32 {
        self.age
    }

    fn absorb(&mut self, detection: &Detection) {
        self.bbox = detection.bbox();
        self.confidence = detection.confidence();
        self.class_label = detection.class_label().to_string();
        self.age = 0;
    }
}

pub struct Tracker {
    config: TrackerConfig,
    /// Live tracks, kept sorted by ascending id.
    tracks: Vec<Track>,
    next_id: u64,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    pub fn config(&self) -> TrackerConfig {
        self.config
    }

    /// Associate one frame's detections with the live tracks.
    ///
    /// Returns the tracks matched or created on this tick, in ascending id order.
    /// Tracks that went unmatched are still held (see `tracks`) until they expire.
    pub fn update(&mut self, detections: &[Detection]) -> Vec<Track> {
        let mut claimed = vec![false; detections.len()];
        let mut matched = vec![false; self.tracks.len()];

        for (track_idx, track) in self.tracks.iter_mut().enumerate() {
            let mut best: Option<(usize, f32)> = None;
            for (det_idx, detection) in detections.iter().enumerate() {
                if claimed[det_idx] {
                    continue;
                }
                let overlap = iou(&track.bbox, &detection.bbox());
                // Strict comparison keeps the lowest detection index on ties.
                if best.map_or(true, |(_, best_iou)| overlap > best_iou) {
                    best = Some((det_idx, overlap));
                }
            }
            if let Some((det_idx, overlap)) = best {
                if overlap >= self.config.iou_threshold {
                    claimed[det_idx] = true;
                    matched[track_idx] = true;
                    track.absorb(&detections[det_idx]);
                }
            }
        }

        for (track, was_matched) in self.tracks.iter_mut().zip(&matched) {
            if !was_matched {
                track.age = track.age.saturating_add(1);
            }
        }
        let max_age = self.config.max_age;
        self.tracks.retain(|track| track.age <= max_age);

        for (detection, was_claimed) in detections.iter().zip(&claimed) {
            if *was_claimed {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.tracks.push(Track {
                id,
                bbox: detection.bbox(),
                confidence: detection.confidence(),
                class_label: detection.class_label().to_string(),
                age: 0,
            });
        }

        self.tracks
            .iter()
            .filter(|track| track.age == 0)
            .cloned()
            .collect()
    }

    /// All live tracks, including ones coasting without a match.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn get(&self, id: u64) -> Option<&Track> {
        self.tracks.iter().find(|track| track.id == id)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection::new(BBox::new(x1, y1, x2, y2), 0.9, "person")
    }

    #[test]
    fn iou_is_symmetric_and_bounded() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 0.0, 15.0, 10.0);
        let far = BBox::new(100.0, 100.0, 110.0, 110.0);

        assert_eq!(iou(&a, &b), iou(&b, &a));
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(iou(&a, &a), 1.0);
        assert_eq!(iou(&a, &far), 0.0);
        // Touching edges share no area.
        assert_eq!(iou(&a, &BBox::new(10.0, 0.0, 20.0, 10.0)), 0.0);
        assert_eq!(iou(&BBox::default(), &BBox::default()), 0.0);
    }

    #[test]
    fn ids_start_at_one_and_strictly_increase() {
        let mut tracker = Tracker::default();
        let first = tracker.update(&[det(0.0, 0.0, 10.0, 10.0), det(50.0, 50.0, 60.0, 60.0)]);
        assert_eq!(first.iter().map(Track::id).collect::<Vec<_>>(), vec![1, 2]);

        let second = tracker.update(&[det(200.0, 200.0, 210.0, 210.0)]);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id(), 3);
    }

    #[test]
    fn ids_are_never_reused_after_expiry() {
        let mut tracker = Tracker::new(TrackerConfig {
            iou_threshold: 0.3,
            max_age: 1,
        });
        tracker.update(&[det(0.0, 0.0, 10.0, 10.0)]);
        tracker.update(&[]);
        tracker.update(&[]);
        assert!(tracker.is_empty());

        let revived = tracker.update(&[det(0.0, 0.0, 10.0, 10.0)]);
        assert_eq!(revived[0].id(), 2);
    }

    #[test]
    fn matched_track_keeps_identity_and_resets_age() {
        let mut tracker = Tracker::default();
        tracker.update(&[det(0.0, 0.0, 10.0, 10.0)]);
        tracker.update(&[]);
        tracker.update(&[]);
        assert_eq!(tracker.get(1).map(Track::age), Some(2));

        let out = tracker.update(&[Detection::new(BBox::new(1.0, 0.0, 11.0, 10.0), 0.6, "dog")]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id(), 1);
        assert_eq!(out[0].age(), 0);
        assert_eq!(out[0].class_label(), "dog");
        assert_eq!(out[0].confidence(), 0.6);
        assert_eq!(out[0].bbox(), BBox::new(1.0, 0.0, 11.0, 10.0));
    }

    #[test]
    fn age_increments_by_one_and_expires_after_max_age() {
        let mut tracker = Tracker::new(TrackerConfig {
            iou_threshold: 0.3,
            max_age: 20,
        });
        tracker.update(&[det(0.0, 0.0, 10.0, 10.0)]);

        for expected_age in 1..=20 {
            let returned = tracker.update(&[]);
            assert!(returned.is_empty());
            assert_eq!(tracker.get(1).map(Track::age), Some(expected_age));
        }

        tracker.update(&[]);
        assert!(tracker.get(1).is_none());
    }

    #[test]
    fn higher_overlap_wins_and_leftover_spawns_new_track() {
        let mut tracker = Tracker::new(TrackerConfig {
            iou_threshold: 0.4,
            max_age: 15,
        });
        tracker.update(&[det(0.0, 0.0, 10.0, 10.0)]);

        // Lower half of the track box: IOU 0.5.
        let strong = Detection::new(BBox::new(0.0, 0.0, 10.0, 5.0), 0.8, "person");
        // Shifted right, overlapping a third of the width: IOU 0.2.
        let shift = 10.0 - 10.0 / 3.0;
        let weak = Detection::new(BBox::new(shift, 0.0, shift + 10.0, 10.0), 0.7, "person");

        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        assert!((iou(&a, &strong.bbox()) - 0.5).abs() < 1e-5);
        assert!((iou(&a, &weak.bbox()) - 0.2).abs() < 1e-5);

        let out = tracker.update(&[weak.clone(), strong.clone()]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id(), 1);
        assert_eq!(out[0].bbox(), strong.bbox());
        assert_eq!(out[1].id(), 2);
        assert_eq!(out[1].bbox(), weak.bbox());
    }

    #[test]
    fn each_detection_is_claimed_once() {
        let mut tracker = Tracker::default();
        tracker.update(&[det(0.0, 0.0, 10.0, 10.0), det(1.0, 0.0, 11.0, 10.0)]);

        let out = tracker.update(&[det(0.0, 0.0, 10.0, 10.0)]);
        assert_eq!(out.len(), 1);
        // Lower id claims first.
        assert_eq!(out[0].id(), 1);
        assert_eq!(tracker.get(2).map(Track::age), Some(1));
    }
}
