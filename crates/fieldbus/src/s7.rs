//! Minimal S7 client over ISO-on-TCP (RFC 1006).
//!
//! Only what the line controller needs is implemented: connection setup,
//! PDU negotiation and single-item read/write of data-block bytes.

use std::{
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::{ControllerLink, error::FieldbusError};

pub const ISO_TCP_PORT: u16 = 102;
/// PDU size asked for during setup; the controller may answer with less.
pub const REQUESTED_PDU: u16 = 480;

const TPKT_VERSION: u8 = 0x03;
const TPKT_HEADER_LEN: usize = 4;
const COTP_CONNECTION_REQUEST: u8 = 0xE0;
const COTP_CONNECTION_CONFIRM: u8 = 0xD0;
const COTP_DATA: [u8; 3] = [0x02, 0xF0, 0x80];

const S7_PROTOCOL_ID: u8 = 0x32;
const ROSCTR_JOB: u8 = 0x01;
const ROSCTR_ACK_DATA: u8 = 0x03;
const ACK_HEADER_LEN: usize = 12;

const FN_SETUP: u8 = 0xF0;
const FN_READ: u8 = 0x04;
const FN_WRITE: u8 = 0x05;
const AREA_DB: u8 = 0x84;
const TRANSPORT_BYTE: u8 = 0x02;
const DATA_SIZE_BITS: u8 = 0x04;
const RETURN_OK: u8 = 0xFF;

const READ_OVERHEAD: usize = 18;
const WRITE_OVERHEAD: usize = 28;

/// Where the controller lives and which CPU to address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S7Endpoint {
    pub host: String,
    pub port: u16,
    pub rack: u8,
    pub slot: u8,
    pub timeout: Duration,
}

impl S7Endpoint {
    pub fn new(host: impl Into<String>, rack: u8, slot: u8) -> Self {
        Self {
            host: host.into(),
            port: ISO_TCP_PORT,
            rack,
            slot,
            timeout: Duration::from_secs(2),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn tpkt(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(TPKT_HEADER_LEN + payload.len());
    buf.put_u8(TPKT_VERSION);
    buf.put_u8(0);
    buf.put_u16((TPKT_HEADER_LEN + payload.len()) as u16);
    buf.put_slice(payload);
    buf.freeze()
}

/// COTP connection request addressing the CPU in `rack`/`slot` as a PG client.
pub fn connection_request(rack: u8, slot: u8) -> Bytes {
    let mut cotp = BytesMut::with_capacity(18);
    cotp.put_u8(0x11);
    cotp.put_u8(COTP_CONNECTION_REQUEST);
    cotp.put_u16(0x0000);
    cotp.put_u16(0x0001);
    cotp.put_u8(0x00);
    cotp.put_slice(&[0xC0, 0x01, 0x0A]);
    cotp.put_slice(&[0xC1, 0x02, 0x01, 0x00]);
    cotp.put_slice(&[0xC2, 0x02, 0x01, rack.wrapping_mul(0x20).wrapping_add(slot)]);
    tpkt(&cotp)
}

fn job(pdu_ref: u16, params: &[u8], data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(COTP_DATA.len() + 10 + params.len() + data.len());
    buf.put_slice(&COTP_DATA);
    buf.put_u8(S7_PROTOCOL_ID);
    buf.put_u8(ROSCTR_JOB);
    buf.put_u16(0);
    buf.put_u16(pdu_ref);
    buf.put_u16(params.len() as u16);
    buf.put_u16(data.len() as u16);
    buf.put_slice(params);
    buf.put_slice(data);
    tpkt(&buf)
}

pub fn setup_request(pdu_ref: u16, pdu_length: u16) -> Bytes {
    let mut params = BytesMut::with_capacity(8);
    params.put_u8(FN_SETUP);
    params.put_u8(0);
    params.put_u16(1);
    params.put_u16(1);
    params.put_u16(pdu_length);
    job(pdu_ref, &params, &[])
}

fn put_db_item(buf: &mut BytesMut, db: u16, start: u32, len: u16) {
    buf.put_slice(&[0x12, 0x0A, 0x10, TRANSPORT_BYTE]);
    buf.put_u16(len);
    buf.put_u16(db);
    buf.put_u8(AREA_DB);
    let bit_address = start * 8;
    buf.put_u8(((bit_address >> 16) & 0xFF) as u8);
    buf.put_u16((bit_address & 0xFFFF) as u16);
}

pub fn read_request(pdu_ref: u16, db: u16, start: u32, len: u16) -> Bytes {
    let mut params = BytesMut::with_capacity(14);
    params.put_u8(FN_READ);
    params.put_u8(1);
    put_db_item(&mut params, db, start, len);
    job(pdu_ref, &params, &[])
}

pub fn write_request(pdu_ref: u16, db: u16, start: u32, data: &[u8]) -> Bytes {
    let mut params = BytesMut::with_capacity(14);
    params.put_u8(FN_WRITE);
    params.put_u8(1);
    put_db_item(&mut params, db, start, data.len() as u16);

    let mut payload = BytesMut::with_capacity(4 + data.len());
    payload.put_u8(0x00);
    payload.put_u8(DATA_SIZE_BITS);
    payload.put_u16((data.len() * 8) as u16);
    payload.put_slice(data);
    job(pdu_ref, &params, &payload)
}

/// Parameter and data sections of an S7 Ack_Data response.
#[derive(Debug, Clone)]
pub struct AckData {
    pub pdu_ref: u16,
    pub params: Bytes,
    pub data: Bytes,
}

/// Parse a TPKT payload (COTP DT header onwards) into its S7 sections.
pub fn parse_ack(mut frame: Bytes) -> Result<AckData, FieldbusError> {
    let cotp_len = *frame
        .first()
        .ok_or_else(|| FieldbusError::protocol("empty COTP frame"))? as usize;
    if frame.len() < cotp_len + 1 + ACK_HEADER_LEN {
        return Err(FieldbusError::protocol(format!(
            "S7 response too short ({} bytes)",
            frame.len()
        )));
    }
    frame.advance(cotp_len + 1);

    let protocol = frame.get_u8();
    let rosctr = frame.get_u8();
    if protocol != S7_PROTOCOL_ID || rosctr != ROSCTR_ACK_DATA {
        return Err(FieldbusError::protocol(format!(
            "unexpected S7 header {protocol:#04x}/{rosctr:#04x}"
        )));
    }
    frame.advance(2);
    let pdu_ref = frame.get_u16();
    let param_len = frame.get_u16() as usize;
    let data_len = frame.get_u16() as usize;
    let class = frame.get_u8();
    let code = frame.get_u8();
    if class != 0 || code != 0 {
        return Err(FieldbusError::Rejected { class, code });
    }
    if frame.remaining() < param_len + data_len {
        return Err(FieldbusError::protocol("S7 response truncated"));
    }
    let params = frame.split_to(param_len);
    let data = frame.split_to(data_len);
    Ok(AckData {
        pdu_ref,
        params,
        data,
    })
}

/// [`parse_ack`] for the answer to request `pdu_ref`. A reply to an earlier
/// request means the stream is out of step.
pub fn parse_reply(frame: Bytes, pdu_ref: u16) -> Result<AckData, FieldbusError> {
    let ack = parse_ack(frame)?;
    if ack.pdu_ref != pdu_ref {
        return Err(FieldbusError::StaleReply {
            expected: pdu_ref,
            got: ack.pdu_ref,
        });
    }
    Ok(ack)
}

pub fn parse_setup(ack: &AckData) -> Result<u16, FieldbusError> {
    if ack.params.len() < 8 || ack.params[0] != FN_SETUP {
        return Err(FieldbusError::protocol("malformed setup communication response"));
    }
    Ok(u16::from_be_bytes([ack.params[6], ack.params[7]]))
}

pub fn parse_read(ack: &AckData, expected: usize) -> Result<Vec<u8>, FieldbusError> {
    if ack.params.first() != Some(&FN_READ) {
        return Err(FieldbusError::protocol("response is not a read var answer"));
    }
    let data = &ack.data;
    let return_code = *data
        .first()
        .ok_or_else(|| FieldbusError::protocol("read var answer without data"))?;
    if return_code != RETURN_OK {
        return Err(FieldbusError::ItemAccess(return_code));
    }
    if data.len() < 4 {
        return Err(FieldbusError::protocol("read var item header truncated"));
    }
    let transport = data[1];
    let raw_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let len = if matches!(transport, 0x03..=0x05) {
        raw_len / 8
    } else {
        raw_len
    };
    if len != expected || data.len() < 4 + len {
        return Err(FieldbusError::protocol(format!(
            "read var returned {len} bytes, expected {expected}"
        )));
    }
    Ok(data[4..4 + len].to_vec())
}

pub fn parse_write(ack: &AckData) -> Result<(), FieldbusError> {
    if ack.params.first() != Some(&FN_WRITE) {
        return Err(FieldbusError::protocol("response is not a write var answer"));
    }
    match ack.data.first() {
        Some(&RETURN_OK) => Ok(()),
        Some(&code) => Err(FieldbusError::ItemAccess(code)),
        None => Err(FieldbusError::protocol("write var answer without data")),
    }
}

/// Read one TPKT frame and return its payload.
pub fn read_tpkt(reader: &mut impl Read) -> Result<Bytes, FieldbusError> {
    let mut header = [0u8; TPKT_HEADER_LEN];
    reader.read_exact(&mut header)?;
    if header[0] != TPKT_VERSION {
        return Err(FieldbusError::protocol(format!(
            "bad TPKT version {:#04x}",
            header[0]
        )));
    }
    let total = u16::from_be_bytes([header[2], header[3]]) as usize;
    if total <= TPKT_HEADER_LEN {
        return Err(FieldbusError::protocol("TPKT frame without payload"));
    }
    let mut payload = vec![0u8; total - TPKT_HEADER_LEN];
    reader.read_exact(&mut payload)?;
    Ok(Bytes::from(payload))
}

/// Blocking S7 client. One request in flight at a time.
pub struct S7Client {
    endpoint: S7Endpoint,
    stream: Option<TcpStream>,
    pdu_length: u16,
    pdu_ref: u16,
}

impl S7Client {
    pub fn new(endpoint: S7Endpoint) -> Self {
        Self {
            endpoint,
            stream: None,
            pdu_length: 0,
            pdu_ref: 0,
        }
    }

    pub fn endpoint(&self) -> &S7Endpoint {
        &self.endpoint
    }

    /// Negotiated PDU length, zero while disconnected.
    pub fn pdu_length(&self) -> u16 {
        self.pdu_length
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1).max(1);
        self.pdu_ref
    }

    /// Send a request and wait for the answer. A transport failure drops
    /// the connection.
    fn exchange(&mut self, request: &[u8]) -> Result<Bytes, FieldbusError> {
        let stream = self.stream.as_mut().ok_or(FieldbusError::NotConnected)?;
        let result = stream
            .write_all(request)
            .map_err(FieldbusError::from)
            .and_then(|_| read_tpkt(stream));
        if result.is_err() {
            self.stream = None;
            self.pdu_length = 0;
        }
        result
    }

    /// Exchange one job and match the reply to it. An out-of-step reply
    /// drops the connection.
    fn transact(&mut self, request: &[u8], pdu_ref: u16) -> Result<AckData, FieldbusError> {
        let frame = self.exchange(request)?;
        let reply = parse_reply(frame, pdu_ref);
        if let Err(err @ FieldbusError::StaleReply { .. }) = &reply {
            warn!(addr = %self.endpoint.address(), "{err}");
            self.disconnect();
        }
        reply
    }

    fn negotiate(&mut self) -> Result<(), FieldbusError> {
        let confirm = self.exchange(&connection_request(self.endpoint.rack, self.endpoint.slot))?;
        if confirm.get(1) != Some(&COTP_CONNECTION_CONFIRM) {
            return Err(FieldbusError::protocol("COTP connection was not confirmed"));
        }
        let pdu_ref = self.next_ref();
        let ack = self.transact(&setup_request(pdu_ref, REQUESTED_PDU), pdu_ref)?;
        self.pdu_length = parse_setup(&ack)?;
        debug!(
            addr = %self.endpoint.address(),
            rack = self.endpoint.rack,
            slot = self.endpoint.slot,
            pdu = self.pdu_length,
            "S7 session established"
        );
        Ok(())
    }
}

impl ControllerLink for S7Client {
    fn connect(&mut self) -> Result<(), FieldbusError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addr = self.endpoint.address();
        let connect_err = |source: io::Error| FieldbusError::Connect {
            addr: addr.clone(),
            source,
        };
        let socket = addr
            .to_socket_addrs()
            .map_err(connect_err)?
            .next()
            .ok_or_else(|| {
                connect_err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "address did not resolve",
                ))
            })?;
        let stream =
            TcpStream::connect_timeout(&socket, self.endpoint.timeout).map_err(connect_err)?;
        stream.set_read_timeout(Some(self.endpoint.timeout))?;
        stream.set_write_timeout(Some(self.endpoint.timeout))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);

        let negotiated = self.negotiate();
        if negotiated.is_err() {
            self.disconnect();
        }
        negotiated
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            debug!(addr = %self.endpoint.address(), "S7 session closed");
        }
        self.pdu_length = 0;
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn read_db(&mut self, db: u16, start: u32, len: u16) -> Result<Vec<u8>, FieldbusError> {
        if !self.is_connected() {
            return Err(FieldbusError::NotConnected);
        }
        if len as usize + READ_OVERHEAD > self.pdu_length as usize {
            return Err(FieldbusError::PduTooSmall {
                requested: len as usize,
                pdu: self.pdu_length,
            });
        }
        let pdu_ref = self.next_ref();
        let ack = self.transact(&read_request(pdu_ref, db, start, len), pdu_ref)?;
        let bytes = parse_read(&ack, len as usize)?;
        trace!(db, start, ?bytes, "read data block");
        Ok(bytes)
    }

    fn write_db(&mut self, db: u16, start: u32, data: &[u8]) -> Result<(), FieldbusError> {
        if !self.is_connected() {
            return Err(FieldbusError::NotConnected);
        }
        if data.len() + WRITE_OVERHEAD > self.pdu_length as usize {
            return Err(FieldbusError::PduTooSmall {
                requested: data.len(),
                pdu: self.pdu_length,
            });
        }
        let pdu_ref = self.next_ref();
        let ack = self.transact(&write_request(pdu_ref, db, start, data), pdu_ref)?;
        parse_write(&ack)?;
        trace!(db, start, ?data, "wrote data block");
        Ok(())
    }
}

impl Drop for S7Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}
