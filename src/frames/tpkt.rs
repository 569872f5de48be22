// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! RFC 1006 TPKT framing, the outermost 4 bytes of every exchange.

use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16,
    Unaligned,
};

use crate::error::S7Error;

pub const TPKT_LEN: usize = 4;
pub const TPKT_VERSION: u8 = 0x03;

/// The 4-byte RFC 1006 header. `length` covers the whole frame, header
/// included.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct TpktHeader {
    pub version: u8,
    pub reserved: u8,
    pub length: U16<BigEndian>,
}

impl TpktHeader {
    pub fn new(frame_len: u16) -> Self {
        TpktHeader {
            version: TPKT_VERSION,
            reserved: 0,
            length: U16::new(frame_len),
        }
    }

    /// Parse and validate the leading 4 bytes of a frame.
    pub fn parse(buf: &[u8]) -> Result<&Self, S7Error> {
        if buf.len() < TPKT_LEN {
            return Err(S7Error::ShortFrame {
                need: TPKT_LEN,
                got: buf.len(),
            });
        }
        let (hdr, _) = Self::ref_from_prefix(buf)
            .map_err(|e| S7Error::MalformedFrame(format!("TPKT header: {e}")))?;
        if hdr.version != TPKT_VERSION {
            return Err(S7Error::MalformedFrame(format!(
                "TPKT version 0x{:02x}",
                hdr.version
            )));
        }
        if (hdr.length.get() as usize) < TPKT_LEN {
            return Err(S7Error::MalformedFrame(format!(
                "TPKT length {} shorter than its own header",
                hdr.length.get()
            )));
        }
        Ok(hdr)
    }

    pub fn frame_len(&self) -> usize {
        self.length.get() as usize
    }
}

/// Stamp the TPKT header onto a fully assembled frame buffer.
pub fn finish_frame(frame: &mut [u8]) -> Result<(), S7Error> {
    let len = u16::try_from(frame.len()).map_err(|_| {
        S7Error::MalformedFrame(format!("frame of {} bytes exceeds TPKT", frame.len()))
    })?;
    let hdr = TpktHeader::new(len);
    frame[..TPKT_LEN].copy_from_slice(hdr.as_bytes());
    Ok(())
}
