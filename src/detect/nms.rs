use crate::track::iou;
use crate::Detection;

/// Greedy non-maximum suppression, class-agnostic.
///
/// Keeps the highest-confidence box of every cluster whose pairwise IOU exceeds
/// `iou_threshold`. The result is ordered by descending confidence.
pub fn non_max_suppression(detections: &mut Vec<Detection>, iou_threshold: f32) {
    detections.sort_by(|a, b| b.confidence().total_cmp(&a.confidence()));

    let mut kept = 0;
    for index in 0..detections.len() {
        let candidate = detections[index].bbox();
        let suppressed = detections[..kept]
            .iter()
            .any(|prev| iou(&prev.bbox(), &candidate) > iou_threshold);
        if !suppressed {
            detections.swap(kept, index);
            kept += 1;
        }
    }
    detections.truncate(kept);
}
