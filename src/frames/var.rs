// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! ReadVar (0x04) and WriteVar (0x05) requests and responses.
//!
//! A request is the 19-byte header (TPKT + COTP + S7 job header + function
//! byte + item count) followed by one 12-byte variable specification per
//! item. Responses carry one result item per specification; odd-length
//! payloads are padded with a zero byte unless they are the last item.

use bytes::Bytes;

use crate::{
    addr::Area,
    error::S7Error,
    frames::header::{ACK_PARAMS_AT, RoSctr, build_job_frame, parse_ack_header},
};

pub const FUNC_READ_VAR: u8 = 0x04;
pub const FUNC_WRITE_VAR: u8 = 0x05;

/// Per-item return code for a successful exchange.
pub const RET_OK: u8 = 0xFF;

/// Transport size codes used inside a variable specification.
const SPEC_TS_BIT: u8 = 0x01;
const SPEC_TS_BYTE: u8 = 0x02;

/// Transport size codes used inside request/response data items.
pub const DATA_TS_BIT: u8 = 0x03;
pub const DATA_TS_BYTE: u8 = 0x04;
pub const DATA_TS_OCTET: u8 = 0x09;

/// One variable specification: an addressed, counted slice of a PLC area.
///
/// `count` is passed through verbatim: byte-granular accesses count bytes,
/// bit accesses count bits, Timer/Counter accesses count elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarSpec {
    pub area: Area,
    /// Data block number, 0 outside the DB area.
    pub db: u16,
    /// Byte offset, or the element index for Timer/Counter.
    pub start: u16,
    /// Bit position for bit-granular access.
    pub bit: Option<u8>,
    pub count: u16,
}

impl VarSpec {
    pub fn bytes_at(area: Area, db: u16, start: u16, count: u16) -> Self {
        VarSpec {
            area,
            db,
            start,
            bit: None,
            count,
        }
    }

    pub fn bit_at(area: Area, db: u16, start: u16, bit: u8) -> Self {
        VarSpec {
            area,
            db,
            start,
            bit: Some(bit),
            count: 1,
        }
    }

    fn transport(&self) -> u8 {
        if self.area.is_indexed() {
            // Timer/Counter reuse their area code as the transport size.
            self.area.code()
        } else if self.bit.is_some() {
            SPEC_TS_BIT
        } else {
            SPEC_TS_BYTE
        }
    }

    /// 24-bit area offset: bit-granular for byte areas, plain element index
    /// for Timer/Counter.
    fn address(&self) -> u32 {
        if self.area.is_indexed() {
            self.start as u32
        } else {
            (self.start as u32) * 8 + self.bit.unwrap_or(0) as u32
        }
    }

    /// The 12-byte wire form.
    pub fn to_wire(&self) -> [u8; 12] {
        let addr = self.address();
        [
            0x12, // variable specification
            0x0A, // remaining spec length
            0x10, // syntax id: S7-Any
            self.transport(),
            (self.count >> 8) as u8,
            (self.count & 0xFF) as u8,
            (self.db >> 8) as u8,
            (self.db & 0xFF) as u8,
            self.area.code(),
            (addr >> 16) as u8,
            (addr >> 8) as u8,
            (addr & 0xFF) as u8,
        ]
    }

    /// Payload bytes this specification produces or consumes.
    pub fn payload_bytes(&self) -> usize {
        if self.area.is_indexed() {
            self.count as usize * 2
        } else if self.bit.is_some() {
            (self.count as usize).div_ceil(8)
        } else {
            self.count as usize
        }
    }
}

/// Build a ReadVar request for `specs`. Deterministic: the same items
/// always yield a byte-identical vector.
pub fn build_read_var(pdu_ref: u16, specs: &[VarSpec]) -> Result<Vec<u8>, S7Error> {
    build_var_request(FUNC_READ_VAR, pdu_ref, specs, &[])
}

/// Build a WriteVar request carrying one payload per specification.
pub fn build_write_var(
    pdu_ref: u16,
    items: &[(VarSpec, &[u8])],
) -> Result<Vec<u8>, S7Error> {
    let specs: Vec<VarSpec> = items.iter().map(|(s, _)| *s).collect();

    let mut data = Vec::new();
    for (i, (spec, payload)) in items.iter().enumerate() {
        let (transport, length) = if spec.bit.is_some() {
            (DATA_TS_BIT, spec.count)
        } else if spec.area.is_indexed() {
            (DATA_TS_OCTET, payload.len() as u16)
        } else {
            (DATA_TS_BYTE, (payload.len() * 8) as u16)
        };
        data.push(0x00); // reserved
        data.push(transport);
        data.extend_from_slice(&length.to_be_bytes());
        data.extend_from_slice(payload);
        if payload.len() % 2 == 1 && i + 1 < items.len() {
            data.push(0x00);
        }
    }

    build_var_request(FUNC_WRITE_VAR, pdu_ref, &specs, &data)
}

fn build_var_request(
    function: u8,
    pdu_ref: u16,
    specs: &[VarSpec],
    data: &[u8],
) -> Result<Vec<u8>, S7Error> {
    if specs.is_empty() || specs.len() > u8::MAX as usize {
        return Err(S7Error::MalformedFrame(format!(
            "{} variable specifications in one request",
            specs.len()
        )));
    }
    let mut params = Vec::with_capacity(2 + specs.len() * 12);
    params.push(function);
    params.push(specs.len() as u8);
    for spec in specs {
        params.extend_from_slice(&spec.to_wire());
    }
    build_job_frame(RoSctr::Job, pdu_ref, &params, data)
}

/// One decoded response item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadItem {
    pub code: u8,
    pub transport: u8,
    pub data: Bytes,
}

impl ReadItem {
    /// Payload on success, typed error otherwise.
    pub fn into_data(self) -> Result<Bytes, S7Error> {
        if self.code == RET_OK {
            Ok(self.data)
        } else {
            Err(S7Error::BadReturnCode(self.code))
        }
    }
}

/// Parse a ReadVar response into its items.
pub fn parse_read_var_response(frame: &[u8]) -> Result<Vec<ReadItem>, S7Error> {
    let (count, mut at) = parse_var_ack(frame, FUNC_READ_VAR, S7Error::ReadData)?;

    let mut items = Vec::with_capacity(count);
    for i in 0..count {
        let head = frame
            .get(at..at + 4)
            .ok_or_else(|| S7Error::ShortFrame {
                need: at + 4,
                got: frame.len(),
            })?;
        let code = head[0];
        let transport = head[1];
        let length = u16::from_be_bytes([head[2], head[3]]) as usize;
        // Octet-string items count bytes, everything else counts bits.
        let payload_len = if transport == DATA_TS_OCTET {
            length
        } else {
            length.div_ceil(8)
        };
        at += 4;
        let payload = frame
            .get(at..at + payload_len)
            .ok_or_else(|| S7Error::ShortFrame {
                need: at + payload_len,
                got: frame.len(),
            })?;
        items.push(ReadItem {
            code,
            transport,
            data: Bytes::copy_from_slice(payload),
        });
        at += payload_len;
        // Zero pad between items when the payload length is odd.
        if payload_len % 2 == 1 && i + 1 < count {
            at += 1;
        }
    }
    Ok(items)
}

/// Parse a WriteVar response: one return code per written item.
pub fn parse_write_var_response(frame: &[u8]) -> Result<Vec<u8>, S7Error> {
    let (count, at) = parse_var_ack(frame, FUNC_WRITE_VAR, S7Error::WriteData)?;
    let codes = frame.get(at..at + count).ok_or_else(|| S7Error::ShortFrame {
        need: at + count,
        got: frame.len(),
    })?;
    Ok(codes.to_vec())
}

/// Shared ack-data validation: returns the item count and the offset of the
/// first data item.
fn parse_var_ack(
    frame: &[u8],
    function: u8,
    plc_err: S7Error,
) -> Result<(usize, usize), S7Error> {
    let hdr = parse_ack_header(frame, RoSctr::AckData)?;
    if hdr.err_class != 0 || hdr.err_code != 0 {
        return Err(plc_err);
    }
    let param_len = hdr.param_len.get() as usize;
    if param_len < 2 || frame.len() < ACK_PARAMS_AT + param_len {
        return Err(S7Error::ShortFrame {
            need: ACK_PARAMS_AT + param_len.max(2),
            got: frame.len(),
        });
    }
    let got_function = frame[ACK_PARAMS_AT];
    if got_function != function {
        return Err(S7Error::UnsupportedFunction(got_function));
    }
    let count = frame[ACK_PARAMS_AT + 1] as usize;
    Ok((count, ACK_PARAMS_AT + param_len))
}
