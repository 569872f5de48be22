// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed errors for the S7 client.
//!
//! The split follows the layering of the crate: everything that can go wrong
//! on the wire or inside the protocol engine is an [`S7Error`]; orchestration
//! code (config loading, logger bootstrap, examples) uses `anyhow` on top.
//!
//! Every error additionally maps onto a stable numeric [`ErrorCode`] that is
//! persisted in metrics and published on the typed error stream. Parse errors
//! never tear down the session; only transport errors do.

use thiserror::Error;

/// Stable error codes persisted in metrics and published to subscribers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError = 0,
    /// The PLC returned a non-OK per-item return code on a read, or the
    /// exchange yielded nothing usable.
    ReadData = 1,
    /// The PLC rejected a written item.
    WriteData = 2,
    /// TPKT length implies fewer bytes than the function needs, or the
    /// receive path returned short.
    WrongNumberReceivedBytes = 3,
    /// Address unparsable, type did not match the wire decoder, or an
    /// unexpected transport size came back.
    WrongVarFormat = 4,
    /// Socket error, peer close, or a Ready exit during an in-flight ticket.
    ConnectionLost = 5,
    Timeout = 6,
    Cancelled = 7,
}

/// All failures the protocol engine, transport and tag layer can produce.
#[derive(Debug, Error)]
pub enum S7Error {
    /// Length mismatch, bad protocol magic (`0x32`), bad RoSCTR. Data error,
    /// not a transport error.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The buffer ended before the field the parser was about to read.
    #[error("short frame: need {need} bytes, got {got}")]
    ShortFrame { need: usize, got: usize },

    /// A response carried a function code the codec does not speak.
    #[error("unsupported function code 0x{0:02x}")]
    UnsupportedFunction(u8),

    /// Per-item return code other than 0xFF (OK).
    #[error("PLC returned item code 0x{0:02x}")]
    BadReturnCode(u8),

    /// The address text did not match the grammar.
    #[error("cannot parse address {0:?}")]
    BadAddress(String),

    /// Grammar matched but a numeric field is out of its domain
    /// (bit > 7, byte offset > 65535, DB number > 65535).
    #[error("address out of range: {0}")]
    AddressOutOfRange(String),

    /// Decoded wire data does not fit the tag's declared type.
    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch {
        expected: &'static str,
        got: &'static str,
    },

    /// A value fell outside the marshaller's domain for its type
    /// (e.g. a counter above 999, a string longer than its max).
    #[error("value out of range for {ty}: {detail}")]
    ValueOutOfRange { ty: &'static str, detail: String },

    #[error("no tag named {0:?}")]
    UnknownTag(String),

    /// The read path delivered no usable payload for the request.
    #[error("read produced no usable data")]
    ReadData,

    /// The PLC rejected the written data.
    #[error("write rejected by the PLC")]
    WriteData,

    /// Socket-level failure or peer close; also the completion of every
    /// ticket in flight when the session leaves Ready.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    /// The core instance was disposed or the ticket aborted.
    #[error("operation cancelled")]
    Cancelled,
}

impl S7Error {
    /// Map onto the stable code surface of the metrics/error streams.
    pub fn code(&self) -> ErrorCode {
        match self {
            S7Error::MalformedFrame(_) | S7Error::ShortFrame { .. } => {
                ErrorCode::WrongNumberReceivedBytes
            },
            S7Error::UnsupportedFunction(_)
            | S7Error::BadAddress(_)
            | S7Error::AddressOutOfRange(_)
            | S7Error::TypeMismatch { .. }
            | S7Error::ValueOutOfRange { .. }
            | S7Error::UnknownTag(_) => ErrorCode::WrongVarFormat,
            S7Error::BadReturnCode(_) | S7Error::ReadData => ErrorCode::ReadData,
            S7Error::WriteData => ErrorCode::WriteData,
            S7Error::ConnectionLost(_) => ErrorCode::ConnectionLost,
            S7Error::Timeout(_) => ErrorCode::Timeout,
            S7Error::Cancelled => ErrorCode::Cancelled,
        }
    }

    /// True for failures of the TCP session itself, i.e. the ones that must
    /// bounce the connection state machine. Codec errors return false.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            S7Error::ConnectionLost(_) | S7Error::Timeout(_) | S7Error::Cancelled
        )
    }
}

impl From<std::io::Error> for S7Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                S7Error::Timeout("socket operation")
            },
            std::io::ErrorKind::UnexpectedEof => {
                S7Error::ConnectionLost("peer closed the connection".to_string())
            },
            _ => S7Error::ConnectionLost(e.to_string()),
        }
    }
}
