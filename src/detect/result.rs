/// Axis-aligned box in normalized (0..1) frame coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.w).min(other.x + other.w);
        let bottom = (self.y + self.h).min(other.y + other.h);
        let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Inclusive pixel corners `(x0, y0, x1, y1)`, clamped to the frame.
    pub fn to_pixels(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        if width == 0 || height == 0 {
            return None;
        }
        let x0 = ((self.x.max(0.0) * width as f32).floor() as u32).min(width - 1);
        let y0 = ((self.y.max(0.0) * height as f32).floor() as u32).min(height - 1);
        let x1 = (((self.x + self.w).min(1.0) * width as f32).ceil() as u32)
            .saturating_sub(1)
            .min(width - 1);
        let y1 = (((self.y + self.h).min(1.0) * height as f32).ceil() as u32)
            .saturating_sub(1)
            .min(height - 1);
        if x1 < x0 || y1 < y0 {
            return None;
        }
        Some((x0, y0, x1, y1))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class_label: String,
    /// Confidence in 0..=1.
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Per-class aggregate of one inference call.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassSummary {
    pub label: String,
    pub count: usize,
    pub mean_confidence: f32,
}

/// Detections of one iteration grouped by class label, in first-seen order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionSummary {
    classes: Vec<ClassSummary>,
}

impl DetectionSummary {
    pub fn from_detections(detections: &[Detection]) -> Self {
        let mut classes: Vec<(String, usize, f32)> = Vec::new();
        for detection in detections {
            match classes
                .iter_mut()
                .find(|(label, _, _)| *label == detection.class_label)
            {
                Some((_, count, sum)) => {
                    *count += 1;
                    *sum += detection.confidence;
                }
                None => classes.push((detection.class_label.clone(), 1, detection.confidence)),
            }
        }
        Self {
            classes: classes
                .into_iter()
                .map(|(label, count, sum)| ClassSummary {
                    label,
                    count,
                    mean_confidence: sum / count as f32,
                })
                .collect(),
        }
    }

    pub fn classes(&self) -> &[ClassSummary] {
        &self.classes
    }

    pub fn get(&self, label: &str) -> Option<&ClassSummary> {
        self.classes.iter().find(|class| class.label == label)
    }

    pub fn total(&self) -> usize {
        self.classes.iter().map(|class| class.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// All classes folded under a single label; the mean is detection-weighted.
    pub fn collapsed(&self, label: &str) -> ClassSummary {
        let total = self.total();
        let weighted: f32 = self
            .classes
            .iter()
            .map(|class| class.mean_confidence * class.count as f32)
            .sum();
        ClassSummary {
            label: label.to_string(),
            count: total,
            mean_confidence: if total == 0 {
                0.0
            } else {
                weighted / total as f32
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(label: &str, confidence: f32) -> Detection {
        Detection {
            class_label: label.to_string(),
            confidence,
            bbox: BoundingBox {
                x: 0.1,
                y: 0.1,
                w: 0.2,
                h: 0.2,
            },
        }
    }

    #[test]
    fn summary_groups_by_class_in_first_seen_order() {
        let summary = DetectionSummary::from_detections(&[
            det("person", 0.8),
            det("vehicle", 0.9),
            det("person", 0.6),
        ]);
        assert_eq!(summary.total(), 3);
        assert_eq!(summary.classes()[0].label, "person");
        assert_eq!(summary.classes()[1].label, "vehicle");

        let person = summary.get("person").unwrap();
        assert_eq!(person.count, 2);
        assert!((person.mean_confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn collapsed_summary_weights_by_count() {
        let summary = DetectionSummary::from_detections(&[
            det("person", 0.6),
            det("person", 0.6),
            det("vehicle", 0.9),
        ]);
        let collapsed = summary.collapsed("intruder");
        assert_eq!(collapsed.label, "intruder");
        assert_eq!(collapsed.count, 3);
        assert!((collapsed.mean_confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn empty_summary() {
        let summary = DetectionSummary::from_detections(&[]);
        assert!(summary.is_empty());
        assert_eq!(summary.collapsed("x").mean_confidence, 0.0);
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BoundingBox {
            x: 0.0,
            y: 0.0,
            w: 0.5,
            h: 0.5,
        };
        let b = BoundingBox {
            x: 0.5,
            y: 0.5,
            w: 0.5,
            h: 0.5,
        };
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn pixel_corners_are_clamped() {
        let bbox = BoundingBox {
            x: -0.2,
            y: 0.5,
            w: 2.0,
            h: 2.0,
        };
        assert_eq!(bbox.to_pixels(10, 10), Some((0, 5, 9, 9)));
        assert_eq!(bbox.to_pixels(0, 10), None);
    }
}
