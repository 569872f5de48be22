// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The S7 PDU header following the COTP data header.
//!
//! Job requests carry the 10-byte form; Ack-Data responses append a 2-byte
//! error class/code pair. All offsets in the response parsers of this crate
//! are derived from these two layouts:
//!
//! ```text
//! offset 0..4   TPKT
//! offset 4..7   COTP DT (02 F0 80)
//! offset 7..17  S7 job header           → parameters at 17
//! offset 7..19  S7 ack-data header      → parameters at 19
//! ```

use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16,
    Unaligned,
};

use crate::{error::S7Error, frames::tpkt::TPKT_LEN};

pub const S7_PROTOCOL_ID: u8 = 0x32;

/// COTP data-transfer header: length 2, DT code 0xF0, EOT bit set.
pub const COTP_DT: [u8; 3] = [0x02, 0xF0, 0x80];

/// Offset of the S7 header inside a framed PDU.
pub const S7_HEADER_AT: usize = TPKT_LEN + COTP_DT.len();
/// First parameter byte of a job request.
pub const JOB_PARAMS_AT: usize = S7_HEADER_AT + 10;
/// First parameter byte of an ack-data response.
pub const ACK_PARAMS_AT: usize = S7_HEADER_AT + 12;

/// Remote-operating-service control byte: the S7 message class.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoSctr {
    Job = 0x01,
    Ack = 0x02,
    AckData = 0x03,
    UserData = 0x07,
}

/// 10-byte header of job requests and UserData frames.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct S7JobHeader {
    pub protocol_id: u8,
    pub rosctr: u8,
    pub redundancy: U16<BigEndian>,
    pub pdu_ref: U16<BigEndian>,
    pub param_len: U16<BigEndian>,
    pub data_len: U16<BigEndian>,
}

impl S7JobHeader {
    pub fn new(rosctr: RoSctr, pdu_ref: u16, param_len: u16, data_len: u16) -> Self {
        S7JobHeader {
            protocol_id: S7_PROTOCOL_ID,
            rosctr: rosctr as u8,
            redundancy: U16::new(0),
            pdu_ref: U16::new(pdu_ref),
            param_len: U16::new(param_len),
            data_len: U16::new(data_len),
        }
    }
}

/// 12-byte header of Ack-Data responses.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct S7AckHeader {
    pub protocol_id: u8,
    pub rosctr: u8,
    pub redundancy: U16<BigEndian>,
    pub pdu_ref: U16<BigEndian>,
    pub param_len: U16<BigEndian>,
    pub data_len: U16<BigEndian>,
    pub err_class: u8,
    pub err_code: u8,
}

/// Validate the envelope of a response frame and return its S7 header.
///
/// Checks the TPKT length against the received byte count, the protocol
/// magic, and the expected RoSCTR. The error pair is left to the caller —
/// read and write map it onto different codes.
pub fn parse_ack_header(frame: &[u8], expect: RoSctr) -> Result<&S7AckHeader, S7Error> {
    let tpkt = crate::frames::tpkt::TpktHeader::parse(frame)?;
    if tpkt.frame_len() != frame.len() {
        return Err(S7Error::ShortFrame {
            need: tpkt.frame_len(),
            got: frame.len(),
        });
    }
    if frame.len() < ACK_PARAMS_AT {
        return Err(S7Error::ShortFrame {
            need: ACK_PARAMS_AT,
            got: frame.len(),
        });
    }
    let (hdr, _) = S7AckHeader::ref_from_prefix(&frame[S7_HEADER_AT..])
        .map_err(|e| S7Error::MalformedFrame(format!("S7 header: {e}")))?;
    if hdr.protocol_id != S7_PROTOCOL_ID {
        return Err(S7Error::MalformedFrame(format!(
            "protocol id 0x{:02x}",
            hdr.protocol_id
        )));
    }
    if hdr.rosctr != expect as u8 {
        return Err(S7Error::MalformedFrame(format!(
            "RoSCTR 0x{:02x}, expected 0x{:02x}",
            hdr.rosctr, expect as u8
        )));
    }
    Ok(hdr)
}

/// Validate a UserData response (SZL, CPU status) and return its 10-byte
/// header.
pub fn parse_userdata_header(frame: &[u8]) -> Result<&S7JobHeader, S7Error> {
    let tpkt = crate::frames::tpkt::TpktHeader::parse(frame)?;
    if tpkt.frame_len() != frame.len() {
        return Err(S7Error::ShortFrame {
            need: tpkt.frame_len(),
            got: frame.len(),
        });
    }
    if frame.len() < JOB_PARAMS_AT {
        return Err(S7Error::ShortFrame {
            need: JOB_PARAMS_AT,
            got: frame.len(),
        });
    }
    let (hdr, _) = S7JobHeader::ref_from_prefix(&frame[S7_HEADER_AT..])
        .map_err(|e| S7Error::MalformedFrame(format!("S7 header: {e}")))?;
    if hdr.protocol_id != S7_PROTOCOL_ID {
        return Err(S7Error::MalformedFrame(format!(
            "protocol id 0x{:02x}",
            hdr.protocol_id
        )));
    }
    if hdr.rosctr != RoSctr::UserData as u8 {
        return Err(S7Error::MalformedFrame(format!(
            "RoSCTR 0x{:02x}, expected UserData",
            hdr.rosctr
        )));
    }
    Ok(hdr)
}

/// Assemble TPKT + COTP DT + S7 job header + parameters + data into one
/// owned frame.
pub fn build_job_frame(
    rosctr: RoSctr,
    pdu_ref: u16,
    params: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, S7Error> {
    let total = S7_HEADER_AT + 10 + params.len() + data.len();
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&[0u8; TPKT_LEN]);
    frame.extend_from_slice(&COTP_DT);
    let hdr = S7JobHeader::new(rosctr, pdu_ref, params.len() as u16, data.len() as u16);
    frame.extend_from_slice(hdr.as_bytes());
    frame.extend_from_slice(params);
    frame.extend_from_slice(data);
    crate::frames::tpkt::finish_frame(&mut frame)?;
    Ok(frame)
}
