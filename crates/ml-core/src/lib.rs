//! Detection primitives shared by the inspection workers.
//!
//! The detector itself is an external capability: anything implementing
//! [`ObjectDetector`] can feed the pipeline. Enable the `with-tch` feature to
//! pull in the TorchScript-backed [`detector::TorchDetector`].

pub mod detection;
pub mod detector;
pub mod filter;

pub use detection::{BoundingBox, ClassLabels, Detection, ROLLER_LABEL, RawDetection};
pub use detector::{FrameView, ObjectDetector};
pub use filter::{
    ClassThresholds, DEFAULT_CONFIDENCE_PERCENT, DEFAULT_MIN_AREA, DEFAULT_MODEL_CONFIDENCE,
    FilterOutcome, GateVerdict, filter_detections,
};

#[cfg(feature = "with-tch")]
pub use tch;
