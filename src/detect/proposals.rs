//! Post-processing for single-shot face detectors.
//!
//! Detectors such as UltraFace emit one `(background, face)` score pair and one
//! normalized `x1, y1, x2, y2` box per anchor. These helpers turn those raw tensors
//! into face rectangles.

use anyhow::{anyhow, Result};

use crate::frame::FaceRect;

/// One scored box in normalized `[0, 1]` image coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Proposal {
    pub score: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Proposal {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    /// Intersection over union with `other`.
    pub fn iou(&self, other: &Proposal) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Pixel rectangle in a `width` x `height` image, or `None` when nothing is left after clamping.
    pub fn to_rect(&self, width: u32, height: u32) -> Option<FaceRect> {
        let px = |v: f32, max: u32| ((v.clamp(0.0, 1.0) * max as f32).round() as u32).min(max);
        let rect = FaceRect::new(
            px(self.y1, height),
            px(self.x2, width),
            px(self.y2, height),
            px(self.x1, width),
        );
        (!rect.is_empty()).then_some(rect)
    }
}

/// Pair flat score and box tensors, keeping anchors whose face score reaches `threshold`.
pub fn decode(scores: &[f32], boxes: &[f32], threshold: f32) -> Result<Vec<Proposal>> {
    if scores.len() % 2 != 0 || boxes.len() % 4 != 0 || scores.len() / 2 != boxes.len() / 4 {
        return Err(anyhow!(
            "detector output mismatch: {} scores for {} box values",
            scores.len(),
            boxes.len()
        ));
    }
    Ok(scores
        .chunks_exact(2)
        .zip(boxes.chunks_exact(4))
        .filter(|(score, _)| score[1] >= threshold)
        .map(|(score, b)| Proposal {
            score: score[1],
            x1: b[0],
            y1: b[1],
            x2: b[2],
            y2: b[3],
        })
        .collect())
}

/// Greedy non-maximum suppression: best score first, overlaps above `iou_threshold` dropped.
pub fn suppress(mut proposals: Vec<Proposal>, iou_threshold: f32) -> Vec<Proposal> {
    proposals.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Proposal> = Vec::new();
    for proposal in proposals {
        if kept.iter().all(|k| k.iou(&proposal) <= iou_threshold) {
            kept.push(proposal);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(score: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> Proposal {
        Proposal {
            score,
            x1,
            y1,
            x2,
            y2,
        }
    }

    #[test]
    fn decode_keeps_confident_anchors() {
        let scores = [0.9, 0.1, 0.2, 0.8, 0.4, 0.6];
        let boxes = [
            0.0, 0.0, 0.1, 0.1, //
            0.2, 0.2, 0.4, 0.5, //
            0.5, 0.5, 0.6, 0.6,
        ];
        let kept = decode(&scores, &boxes, 0.7).unwrap();
        assert_eq!(kept, vec![proposal(0.8, 0.2, 0.2, 0.4, 0.5)]);
        assert!(decode(&scores, &boxes[..8], 0.7).is_err());
    }

    #[test]
    fn overlapping_boxes_collapse_to_the_best() {
        let kept = suppress(
            vec![
                proposal(0.75, 0.11, 0.1, 0.31, 0.3),
                proposal(0.95, 0.1, 0.1, 0.3, 0.3),
                proposal(0.9, 0.6, 0.6, 0.8, 0.8),
            ],
            0.3,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.95);
        assert_eq!(kept[1].score, 0.9);
    }

    #[test]
    fn rectangles_are_clamped_to_the_image() {
        let rect = proposal(1.0, -0.1, 0.25, 0.5, 1.2).to_rect(200, 100).unwrap();
        assert_eq!(rect, FaceRect::new(25, 100, 100, 0));
        assert!(proposal(1.0, 1.1, 0.0, 1.3, 0.5).to_rect(200, 100).is_none());
    }
}
