//! Controller link used by the fieldbus worker.
//!
//! [`s7::S7Client`] speaks S7 over ISO-on-TCP to a Siemens PLC and only
//! touches data-block areas. Anything implementing [`ControllerLink`] can
//! stand in for it, which is how the worker is exercised without hardware.

pub mod bits;
pub mod error;
pub mod s7;

pub use bits::BitAddress;
pub use error::FieldbusError;
pub use s7::{S7Client, S7Endpoint};

/// Byte-level access to one controller's data blocks.
pub trait ControllerLink: Send {
    fn connect(&mut self) -> Result<(), FieldbusError>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    /// Read `len` bytes of data block `db` starting at byte `start`.
    fn read_db(&mut self, db: u16, start: u32, len: u16) -> Result<Vec<u8>, FieldbusError>;
    fn write_db(&mut self, db: u16, start: u32, data: &[u8]) -> Result<(), FieldbusError>;
}
