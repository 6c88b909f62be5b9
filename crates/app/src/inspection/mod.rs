//! Inspection runtime modules.
//!
//! Leaf state (`status`, `frame_buffer`, `roller`) sits under the worker
//! modules (`capture`, `inference`, `slot_control`, `plc`), which the
//! `pipeline` supervisor wires together.

pub mod annotation;
pub mod capture;
pub mod catalog;
pub mod channel;
pub mod command;
pub mod config;
pub mod correlation;
pub mod evidence;
pub mod frame_buffer;
pub mod head_shape;
pub mod inference;
pub mod pipeline;
pub mod plc;
pub mod reporter;
pub mod roller;
pub mod slot_control;
pub mod status;
pub mod telemetry;

pub use channel::Channel;
pub use config::PlantConfig;
pub use status::{SensorBit, StatusStore};
