//! Roller inspection runtime.
//!
//! Two camera channels (BF for the big face, OD for the outer diameter) feed
//! detection workers that track rollers between presence sensors and queue an
//! accept/reject decision per roller. Slot control workers turn decisions into
//! PLC commands when a roller reaches its sorting gate, and a single fieldbus
//! worker owns the controller connection.

pub mod inspection;
