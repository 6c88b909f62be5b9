//! Per-class confidence and size gates applied to raw detections.

use std::collections::HashMap;

use crate::detection::Detection;

/// Confidence (percent) applied to classes missing from the threshold map.
pub const DEFAULT_CONFIDENCE_PERCENT: u32 = 50;
/// Minimum box area (px²) applied to classes missing from the size map.
pub const DEFAULT_MIN_AREA: u32 = 0;
/// Model-wide confidence gate used when the catalog has no entry.
pub const DEFAULT_MODEL_CONFIDENCE: f32 = 0.25;

/// Threshold set fetched once per worker at startup.
#[derive(Debug, Clone)]
pub struct ClassThresholds {
    confidence_percent: HashMap<String, u32>,
    min_area: HashMap<String, u32>,
    model_confidence: f32,
}

impl Default for ClassThresholds {
    fn default() -> Self {
        Self {
            confidence_percent: HashMap::new(),
            min_area: HashMap::new(),
            model_confidence: DEFAULT_MODEL_CONFIDENCE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    Keep,
    BelowModelConfidence,
    BelowClassConfidence,
    BelowMinArea,
}

/// Survivors of the gates plus drop counts for telemetry.
#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    pub kept: Vec<Detection>,
    pub dropped_confidence: usize,
    pub dropped_size: usize,
}

impl ClassThresholds {
    pub fn new(
        confidence_percent: HashMap<String, u32>,
        min_area: HashMap<String, u32>,
        model_confidence: f32,
    ) -> Self {
        Self {
            confidence_percent,
            min_area,
            model_confidence,
        }
    }

    pub fn model_confidence(&self) -> f32 {
        self.model_confidence
    }

    /// Class confidence as a fraction in `0.0..=1.0`.
    pub fn class_confidence(&self, label: &str) -> f32 {
        let percent = self
            .confidence_percent
            .get(label)
            .copied()
            .unwrap_or(DEFAULT_CONFIDENCE_PERCENT);
        percent as f32 / 100.0
    }

    pub fn min_area(&self, label: &str) -> f32 {
        self.min_area
            .get(label)
            .copied()
            .unwrap_or(DEFAULT_MIN_AREA) as f32
    }

    /// Confidence gates run before the size gate.
    pub fn verdict(&self, detection: &Detection) -> GateVerdict {
        if detection.confidence < self.model_confidence {
            return GateVerdict::BelowModelConfidence;
        }
        if detection.confidence < self.class_confidence(&detection.label) {
            return GateVerdict::BelowClassConfidence;
        }
        if detection.bbox.area() < self.min_area(&detection.label) {
            return GateVerdict::BelowMinArea;
        }
        GateVerdict::Keep
    }
}

pub fn filter_detections(detections: Vec<Detection>, thresholds: &ClassThresholds) -> FilterOutcome {
    let mut outcome = FilterOutcome::default();
    for detection in detections {
        match thresholds.verdict(&detection) {
            GateVerdict::Keep => outcome.kept.push(detection),
            GateVerdict::BelowModelConfidence | GateVerdict::BelowClassConfidence => {
                outcome.dropped_confidence += 1
            }
            GateVerdict::BelowMinArea => outcome.dropped_size += 1,
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BoundingBox;

    fn detection(label: &str, confidence: f32, bbox: BoundingBox) -> Detection {
        Detection {
            label: label.to_string(),
            bbox,
            class_id: 0,
            confidence,
        }
    }

    fn rust_thresholds() -> ClassThresholds {
        ClassThresholds::new(
            HashMap::from([("rust".to_string(), 80)]),
            HashMap::from([("rust".to_string(), 1000)]),
            0.25,
        )
    }

    #[test]
    fn test_detection_above_both_gates_is_kept() {
        let det = detection("rust", 0.9, BoundingBox::new(100.0, 100.0, 140.0, 130.0));
        assert_eq!(rust_thresholds().verdict(&det), GateVerdict::Keep);
    }

    #[test]
    fn test_low_confidence_is_dropped_before_size() {
        let det = detection("rust", 0.7, BoundingBox::new(100.0, 100.0, 140.0, 130.0));
        assert_eq!(
            rust_thresholds().verdict(&det),
            GateVerdict::BelowClassConfidence
        );
    }

    #[test]
    fn test_small_box_is_dropped() {
        let det = detection("rust", 0.95, BoundingBox::new(0.0, 0.0, 10.0, 10.0));
        assert_eq!(rust_thresholds().verdict(&det), GateVerdict::BelowMinArea);
    }

    #[test]
    fn test_unknown_class_uses_defaults() {
        let thresholds = ClassThresholds::default();
        assert_eq!(thresholds.class_confidence("dent"), 0.5);
        assert_eq!(thresholds.min_area("dent"), 0.0);
        let det = detection("dent", 0.49, BoundingBox::new(0.0, 0.0, 5.0, 5.0));
        assert_eq!(thresholds.verdict(&det), GateVerdict::BelowClassConfidence);
    }

    #[test]
    fn test_model_gate_applies_to_every_class() {
        let thresholds = ClassThresholds::new(
            HashMap::from([("rust".to_string(), 10)]),
            HashMap::new(),
            0.4,
        );
        let det = detection("rust", 0.3, BoundingBox::new(0.0, 0.0, 50.0, 50.0));
        assert_eq!(thresholds.verdict(&det), GateVerdict::BelowModelConfidence);
    }

    #[test]
    fn test_filter_counts_drops() {
        let outcome = filter_detections(
            vec![
                detection("rust", 0.9, BoundingBox::new(100.0, 100.0, 140.0, 130.0)),
                detection("rust", 0.7, BoundingBox::new(100.0, 100.0, 140.0, 130.0)),
                detection("rust", 0.9, BoundingBox::new(0.0, 0.0, 2.0, 2.0)),
            ],
            &rust_thresholds(),
        );
        assert_eq!(outcome.kept.len(), 1);
        assert_eq!(outcome.dropped_confidence, 1);
        assert_eq!(outcome.dropped_size, 1);
    }
}
