//! Point-inside attribution of defect markers to tracked rollers.
//!
//! Roller markers are ordered by their left edge. The leftmost marker is the
//! roller that entered most recently, so the i-th marker stands for identity
//! `newest - i`. A defect belongs to the first candidate whose box holds
//! either of the defect's corners.

use ml_core::{BoundingBox, Detection};

use crate::inspection::roller::RollerLedger;

/// Roller markers below this confidence are not used for attribution.
pub const ROLLER_MARKER_CONFIDENCE: f32 = 0.80;

#[derive(Debug, Clone, Default)]
pub struct Partition {
    pub rollers: Vec<Detection>,
    pub defects: Vec<Detection>,
}

impl Partition {
    pub fn has_rollers(&self) -> bool {
        !self.rollers.is_empty()
    }

    pub fn has_defects(&self) -> bool {
        !self.defects.is_empty()
    }
}

pub fn sort_by_left_edge(detections: &mut [Detection]) {
    detections.sort_by(|a, b| a.bbox.x1.total_cmp(&b.bbox.x1));
}

/// Split sorted survivors into roller markers and defect markers.
/// Low-confidence roller markers belong to neither.
pub fn partition(detections: &[Detection]) -> Partition {
    let mut out = Partition::default();
    for det in detections {
        if det.is_roller_marker() {
            if det.confidence > ROLLER_MARKER_CONFIDENCE {
                out.rollers.push(det.clone());
            }
        } else {
            out.defects.push(det.clone());
        }
    }
    out
}

/// Identity of the roller whose marker holds a corner of `defect`, if any.
pub fn locate_roller(
    defect: &BoundingBox,
    rollers: &[Detection],
    newest_id: u64,
    window: usize,
) -> Option<u64> {
    let candidates = window
        .min(rollers.len())
        .min(usize::try_from(newest_id).unwrap_or(usize::MAX));
    let corners = defect.corners_px();
    rollers
        .iter()
        .take(candidates)
        .enumerate()
        .find(|(_, marker)| corners.iter().any(|c| marker.bbox.contains(*c)))
        .map(|(i, _)| newest_id - i as u64)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Correlation {
    /// `(roller id, defect name)` pairs applied to the ledger.
    pub attributed: Vec<(u64, String)>,
    /// Defects that fell outside every candidate marker.
    pub unmatched: usize,
    /// Defects matched to a roller that had already been finalized.
    pub stale: usize,
}

pub fn correlate(ledger: &mut RollerLedger, partition: &Partition, window: usize) -> Correlation {
    let mut outcome = Correlation::default();
    let newest = ledger.newest_id();
    for defect in &partition.defects {
        match locate_roller(&defect.bbox, &partition.rollers, newest, window) {
            Some(id) if ledger.attribute(id, &defect.label) => {
                outcome.attributed.push((id, defect.label.clone()));
            }
            Some(_) => outcome.stale += 1,
            None => outcome.unmatched += 1,
        }
    }
    outcome
}
