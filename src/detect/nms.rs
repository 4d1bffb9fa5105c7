use std::cmp::Ordering;

use super::result::Detection;

/// Drop detections under the confidence threshold, then suppress overlapping
/// boxes of the same class whose IoU with a stronger box exceeds `overlap`.
///
/// The output is ordered by descending confidence.
pub fn filter_detections(
    detections: Vec<Detection>,
    confidence: f32,
    overlap: f32,
) -> Vec<Detection> {
    let mut candidates: Vec<Detection> = detections
        .into_iter()
        .filter(|d| d.confidence >= confidence)
        .collect();
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let suppressed = kept.iter().any(|k| {
            k.class_label == candidate.class_label && k.bbox.iou(&candidate.bbox) > overlap
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    fn det(label: &str, confidence: f32, x: f32) -> Detection {
        Detection {
            class_label: label.to_string(),
            confidence,
            bbox: BoundingBox {
                x,
                y: 0.1,
                w: 0.3,
                h: 0.3,
            },
        }
    }

    #[test]
    fn drops_low_confidence() {
        let out = filter_detections(vec![det("tern", 0.4, 0.0), det("tern", 0.8, 0.5)], 0.75, 0.5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, 0.8);
    }

    #[test]
    fn suppresses_overlapping_same_class() {
        let out = filter_detections(
            vec![det("tern", 0.8, 0.0), det("tern", 0.9, 0.02), det("tern", 0.85, 0.6)],
            0.5,
            0.5,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].confidence, 0.9);
        assert_eq!(out[1].confidence, 0.85);
    }

    #[test]
    fn keeps_overlapping_boxes_of_different_classes() {
        let out = filter_detections(
            vec![det("person", 0.9, 0.0), det("vehicle", 0.8, 0.0)],
            0.5,
            0.5,
        );
        assert_eq!(out.len(), 2);
    }
}
