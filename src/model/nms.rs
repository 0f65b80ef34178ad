//! Greedy non-maximum suppression over `[x1, y1, x2, y2]` boxes.

use std::cmp::Ordering;

/// A scored box awaiting suppression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub bbox: [f32; 4],
    pub class_id: u32,
    pub score: f32,
}

/// Intersection over union of two corner-format boxes.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);
    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let area = |r: &[f32; 4]| (r[2] - r[0]).max(0.0) * (r[3] - r[1]).max(0.0);
    let union = area(a) + area(b) - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Keep the highest-scoring boxes, dropping any that overlap a kept box by
/// more than `iou_threshold`. With `agnostic` off, only boxes of the same
/// class suppress each other. Returns indices into `candidates`, best first,
/// at most `max_detections` of them.
pub fn non_max_suppression(
    candidates: &[Candidate],
    iou_threshold: f32,
    agnostic: bool,
    max_detections: usize,
) -> Vec<usize> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| {
        candidates[b]
            .score
            .partial_cmp(&candidates[a].score)
            .unwrap_or(Ordering::Equal)
    });

    let mut keep: Vec<usize> = Vec::with_capacity(max_detections.min(candidates.len()));
    for idx in order {
        if keep.len() >= max_detections {
            break;
        }
        let cand = &candidates[idx];
        let suppressed = keep.iter().any(|&k| {
            let kept = &candidates[k];
            (agnostic || kept.class_id == cand.class_id)
                && iou(&kept.bbox, &cand.bbox) > iou_threshold
        });
        if !suppressed {
            keep.push(idx);
        }
    }
    keep
}
