// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Communication Setup: the PDU-size negotiation that follows the ISO
//! handshake.

use crate::{
    error::S7Error,
    frames::header::{RoSctr, build_job_frame, parse_ack_header},
};

/// Smallest PDU any CPU family accepts.
pub const MIN_PDU_LEN: u16 = 240;
/// Largest PDU the protocol engine will request (S7-1500).
pub const MAX_PDU_LEN: u16 = 1440;

/// Build the 25-byte CommSetup request. Max AMQ calling/called are pinned
/// to 1; the requested PDU length sits at bytes 23..25.
pub fn build_comm_setup(pdu_ref: u16, requested_pdu: u16) -> Result<Vec<u8>, S7Error> {
    let requested = requested_pdu.clamp(MIN_PDU_LEN, MAX_PDU_LEN);
    let params = [
        0xF0, // function: setup communication
        0x00, // reserved
        0x00, 0x01, // max AMQ calling
        0x00, 0x01, // max AMQ called
        (requested >> 8) as u8,
        (requested & 0xFF) as u8,
    ];
    build_job_frame(RoSctr::Job, pdu_ref, &params, &[])
}

/// Parse the CommSetup response and return the PLC-announced PDU length.
///
/// The response must be at least 27 bytes; the announced length sits at
/// bytes 25..27. The effective session PDU is the lesser of requested and
/// announced, decided by the caller.
pub fn parse_comm_setup_response(frame: &[u8]) -> Result<u16, S7Error> {
    if frame.len() < 27 {
        return Err(S7Error::ShortFrame {
            need: 27,
            got: frame.len(),
        });
    }
    let hdr = parse_ack_header(frame, RoSctr::AckData)?;
    if hdr.err_class != 0 || hdr.err_code != 0 {
        return Err(S7Error::MalformedFrame(format!(
            "CommSetup rejected: class 0x{:02x} code 0x{:02x}",
            hdr.err_class, hdr.err_code
        )));
    }
    let announced = u16::from_be_bytes([frame[25], frame[26]]);
    if announced == 0 {
        return Err(S7Error::MalformedFrame(
            "PLC announced a zero PDU length".to_string(),
        ));
    }
    Ok(announced)
}

/// Effective session PDU: the lesser of requested and announced, kept
/// inside the protocol bounds.
pub fn negotiated_pdu(requested: u16, announced: u16) -> u16 {
    requested.min(announced).clamp(MIN_PDU_LEN, MAX_PDU_LEN)
}
