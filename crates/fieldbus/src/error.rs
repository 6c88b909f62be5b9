use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FieldbusError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("controller link is not connected")]
    NotConnected,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("malformed controller frame: {0}")]
    Protocol(String),
    #[error("controller rejected the request (class {class:#04x}, code {code:#04x})")]
    Rejected { class: u8, code: u8 },
    #[error("reply carries PDU reference {got}, request was {expected}")]
    StaleReply { expected: u16, got: u16 },
    #[error("data block item access failed with return code {0:#04x}")]
    ItemAccess(u8),
    #[error("request of {requested} bytes exceeds the negotiated PDU of {pdu} bytes")]
    PduTooSmall { requested: usize, pdu: u16 },
    #[error("invalid bit address {0:?}, expected <byte>.<bit>")]
    BitAddress(String),
}

impl FieldbusError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
