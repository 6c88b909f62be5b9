//! Head-shape measurement for the BF channel.
//!
//! The head classifier finds two concentric references: class 0 is the inner
//! ring and class 1 the outer one. Half the difference of their widths and
//! heights, averaged, gives the head offset in pixels.

use std::fmt;

use ml_core::{BoundingBox, RawDetection};
use serde::{Deserialize, Serialize};

pub const HEAD_DETECTOR_CONFIDENCE: f32 = 0.7;
const INNER_CLASS: i64 = 0;
const OUTER_CLASS: i64 = 1;

/// Acceptable offset range for one roller profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadLimits {
    pub min: f32,
    pub max: f32,
}

impl Default for HeadLimits {
    fn default() -> Self {
        Self {
            min: 180.0,
            max: 240.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadType {
    High,
    Down,
    Normal,
}

impl HeadType {
    pub fn classify(offset: f32, limits: &HeadLimits) -> Self {
        if offset < limits.min {
            HeadType::High
        } else if offset > limits.max {
            HeadType::Down
        } else {
            HeadType::Normal
        }
    }

    /// Name recorded on the roller, matching the defect counters.
    pub fn label(self) -> &'static str {
        match self {
            HeadType::High => "High Head",
            HeadType::Down => "Down Head",
            HeadType::Normal => "Normal",
        }
    }

    pub fn is_defect(self) -> bool {
        self != HeadType::Normal
    }
}

impl fmt::Display for HeadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadMeasurement {
    pub inner: BoundingBox,
    pub outer: BoundingBox,
    pub offset: f32,
    pub head: HeadType,
}

pub fn head_offset(inner: &BoundingBox, outer: &BoundingBox) -> f32 {
    let horizontal = (outer.width() - inner.width()) / 2.0;
    let vertical = (outer.height() - inner.height()) / 2.0;
    (horizontal + vertical) / 2.0
}

fn best_of(detections: &[RawDetection], class_id: i64) -> Option<BoundingBox> {
    detections
        .iter()
        .filter(|d| d.class_id == class_id)
        .max_by(|a, b| a.score.total_cmp(&b.score))
        .map(|d| d.bbox)
}

/// `None` when either reference is missing from the classifier output.
pub fn measure(detections: &[RawDetection], limits: &HeadLimits) -> Option<HeadMeasurement> {
    let inner = best_of(detections, INNER_CLASS)?;
    let outer = best_of(detections, OUTER_CLASS)?;
    let offset = head_offset(&inner, &outer);
    Some(HeadMeasurement {
        inner,
        outer,
        offset,
        head: HeadType::classify(offset, limits),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(class_id: i64, score: f32, bbox: BoundingBox) -> RawDetection {
        RawDetection {
            bbox,
            class_id,
            score,
        }
    }

    #[test]
    fn test_offset_averages_both_axes() {
        let inner = BoundingBox::new(100.0, 100.0, 300.0, 300.0);
        let outer = BoundingBox::new(0.0, 0.0, 600.0, 500.0);
        assert_eq!(head_offset(&inner, &outer), 175.0);
    }

    #[test]
    fn test_classification_boundaries() {
        let limits = HeadLimits::default();
        assert_eq!(HeadType::classify(150.0, &limits), HeadType::High);
        assert_eq!(HeadType::classify(180.0, &limits), HeadType::Normal);
        assert_eq!(HeadType::classify(240.0, &limits), HeadType::Normal);
        assert_eq!(HeadType::classify(240.5, &limits), HeadType::Down);
    }

    #[test]
    fn test_missing_reference_yields_nothing() {
        let only_inner = [raw(0, 0.9, BoundingBox::new(0.0, 0.0, 10.0, 10.0))];
        assert!(measure(&only_inner, &HeadLimits::default()).is_none());
    }

    #[test]
    fn test_high_head_measurement() {
        let detections = [
            raw(1, 0.9, BoundingBox::new(0.0, 0.0, 500.0, 500.0)),
            raw(0, 0.8, BoundingBox::new(150.0, 150.0, 350.0, 350.0)),
            raw(0, 0.75, BoundingBox::new(0.0, 0.0, 20.0, 20.0)),
        ];
        let m = measure(&detections, &HeadLimits::default()).unwrap();
        assert_eq!(m.offset, 150.0);
        assert_eq!(m.head, HeadType::High);
        assert_eq!(m.head.label(), "High Head");
    }
}
