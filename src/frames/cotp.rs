// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! COTP (ISO 8073 class 0) connection setup.
//!
//! The 22-byte Connection Request telegram is fixed apart from the two TSAP
//! identifiers; the destination TSAP low byte encodes the CPU position as
//! `rack * 32 + slot` for the rack-addressed profiles.

use crate::error::S7Error;

/// COTP PDU type codes seen during connection setup.
pub const COTP_CR: u8 = 0xE0;
pub const COTP_CC: u8 = 0xD0;

/// Requested TPDU size code 0x09 = 512 bytes.
const TPDU_SIZE_CODE: u8 = 0x09;

/// Client role announced in the source TSAP, tried in this order until one
/// of them survives CommSetup. S7-200 and LOGO! devices ignore rack/slot and
/// use fixed TSAP pairs instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsapProfile {
    /// Programming-device role.
    Pg,
    /// Operator-panel role.
    Op,
    /// Alternative PG encoding some firmware expects.
    PgAlt,
    /// Fixed pair for S7-200.
    S7_200,
    /// Fixed pair for LOGO! 0BA8.
    Logo,
}

impl TsapProfile {
    /// Source and destination TSAP bytes for this profile.
    pub fn tsap_pair(self, rack: u8, slot: u8) -> ([u8; 2], [u8; 2]) {
        let position = rack.wrapping_mul(32).wrapping_add(slot);
        match self {
            TsapProfile::Pg => ([0x01, 0x00], [0x03, position]),
            TsapProfile::Op => ([0x02, 0x00], [0x03, position]),
            TsapProfile::PgAlt => ([0x10, 0x00], [0x03, position]),
            TsapProfile::S7_200 => ([0x10, 0x00], [0x10, 0x00]),
            TsapProfile::Logo => ([0x01, 0x00], [0x01, 0x02]),
        }
    }
}

impl std::fmt::Display for TsapProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TsapProfile::Pg => "PG",
            TsapProfile::Op => "OP",
            TsapProfile::PgAlt => "PG_Alt",
            TsapProfile::S7_200 => "S7-200",
            TsapProfile::Logo => "LOGO",
        })
    }
}

/// Build the 22-byte ISO Connection Request.
///
/// Source TSAP lands at offsets 13..15, destination TSAP at 17..19.
pub fn build_connection_request(profile: TsapProfile, rack: u8, slot: u8) -> Vec<u8> {
    let (src, dst) = profile.tsap_pair(rack, slot);
    vec![
        0x03, 0x00, 0x00, 0x16, // TPKT, 22 bytes
        0x11,       // COTP header length
        COTP_CR,    // Connection Request
        0x00, 0x00, // destination reference
        0x00, 0x2E, // source reference
        0x00,       // class 0, no options
        0xC1, 0x02, src[0], src[1], // source TSAP
        0xC2, 0x02, dst[0], dst[1], // destination TSAP
        0xC0, 0x01, TPDU_SIZE_CODE, // TPDU size parameter
    ]
}

/// Validate a Connection Confirm telegram.
pub fn parse_connection_confirm(frame: &[u8]) -> Result<(), S7Error> {
    let tpkt = crate::frames::tpkt::TpktHeader::parse(frame)?;
    if tpkt.frame_len() != frame.len() {
        return Err(S7Error::ShortFrame {
            need: tpkt.frame_len(),
            got: frame.len(),
        });
    }
    if frame.len() < 6 {
        return Err(S7Error::ShortFrame {
            need: 6,
            got: frame.len(),
        });
    }
    let pdu_type = frame[5];
    if pdu_type != COTP_CC {
        return Err(S7Error::MalformedFrame(format!(
            "COTP type 0x{pdu_type:02x}, expected Connection Confirm"
        )));
    }
    Ok(())
}
