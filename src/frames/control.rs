// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! PI-service CPU control: warm/cold start and stop.
//!
//! These are plain job requests against the `P_PROGRAM` program invocation.
//! A CPU that is already in the requested state answers with a dedicated
//! parameter byte rather than an error.

use crate::{
    error::S7Error,
    frames::header::{ACK_PARAMS_AT, RoSctr, build_job_frame, parse_ack_header},
};

pub const FUNC_PI_START: u8 = 0x28;
pub const FUNC_PI_STOP: u8 = 0x29;

const ALREADY_STARTED: u8 = 0x02;
const ALREADY_STOPPED: u8 = 0x07;

const PI_PROGRAM: &[u8] = b"P_PROGRAM";

/// Outcome of a start/stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiOutcome {
    Done,
    /// The CPU already was in the requested state.
    AlreadyInState,
}

/// Warm start: program processing resumes, retentive data kept.
pub fn build_warm_start(pdu_ref: u16) -> Result<Vec<u8>, S7Error> {
    let mut params = vec![FUNC_PI_START, 0, 0, 0, 0, 0, 0, 0xFD, 0x00, 0x00];
    params.push(PI_PROGRAM.len() as u8);
    params.extend_from_slice(PI_PROGRAM);
    build_job_frame(RoSctr::Job, pdu_ref, &params, &[])
}

/// Cold start: configuration discarded, initial values reloaded.
pub fn build_cold_start(pdu_ref: u16) -> Result<Vec<u8>, S7Error> {
    let mut params = vec![
        FUNC_PI_START,
        0,
        0,
        0,
        0,
        0,
        0,
        0xFD,
        0x00,
        0x02,
        b'C',
        b' ',
    ];
    params.push(PI_PROGRAM.len() as u8);
    params.extend_from_slice(PI_PROGRAM);
    build_job_frame(RoSctr::Job, pdu_ref, &params, &[])
}

pub fn build_stop(pdu_ref: u16) -> Result<Vec<u8>, S7Error> {
    let mut params = vec![FUNC_PI_STOP, 0, 0, 0, 0, 0];
    params.push(PI_PROGRAM.len() as u8);
    params.extend_from_slice(PI_PROGRAM);
    build_job_frame(RoSctr::Job, pdu_ref, &params, &[])
}

/// Parse a start/stop response. `function` is the request's PI function.
pub fn parse_pi_response(frame: &[u8], function: u8) -> Result<PiOutcome, S7Error> {
    let hdr = parse_ack_header(frame, RoSctr::AckData)?;
    if hdr.err_class != 0 || hdr.err_code != 0 {
        return Err(S7Error::WriteData);
    }
    if frame.len() < ACK_PARAMS_AT + 2 {
        return Err(S7Error::ShortFrame {
            need: ACK_PARAMS_AT + 2,
            got: frame.len(),
        });
    }
    let echoed = frame[ACK_PARAMS_AT];
    if echoed != function {
        return Err(S7Error::UnsupportedFunction(echoed));
    }
    let already = match function {
        FUNC_PI_START => ALREADY_STARTED,
        _ => ALREADY_STOPPED,
    };
    if frame[ACK_PARAMS_AT + 1] == already {
        return Ok(PiOutcome::AlreadyInState);
    }
    Ok(PiOutcome::Done)
}
