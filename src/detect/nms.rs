//! Non-maximum suppression.

use crate::detect::result::BoundingBox;

/// Suppress duplicate overlapping boxes, keeping the highest-confidence one
/// of any pair whose IoU exceeds `iou_threshold`.
///
/// Idempotent: running the output through again removes nothing further,
/// since survivors pairwise overlap at or below the threshold.
pub fn non_max_suppression(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    if boxes.len() <= 1 {
        return boxes;
    }

    boxes.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}
