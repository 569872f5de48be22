// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared session state: connection phase, negotiated PDU length and the
//! error-clustering counters the supervisor watches.
//!
//! Everything here is read from several tasks; phase and counters are plain
//! atomics, the success timestamp sits under a short-lived mutex.

use std::{
    fmt,
    sync::{
        Mutex,
        atomic::{AtomicU8, AtomicU16, AtomicU32, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;

use crate::frames::cotp::TsapProfile;

/// Connection lifecycle. I/O is legal only in [`Phase::Ready`]; leaving
/// Ready cancels in-flight logical operations.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected = 0,
    TcpConnecting = 1,
    IsoHandshake = 2,
    CommSetup = 3,
    Ready = 4,
    Degraded = 5,
    Closing = 6,
}

impl Phase {
    fn from_u8(v: u8) -> Phase {
        match v {
            1 => Phase::TcpConnecting,
            2 => Phase::IsoHandshake,
            3 => Phase::CommSetup,
            4 => Phase::Ready,
            5 => Phase::Degraded,
            6 => Phase::Closing,
            _ => Phase::Disconnected,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Disconnected => "Disconnected",
            Phase::TcpConnecting => "TcpConnecting",
            Phase::IsoHandshake => "IsoHandshake",
            Phase::CommSetup => "CommSetup",
            Phase::Ready => "Ready",
            Phase::Degraded => "Degraded",
            Phase::Closing => "Closing",
        })
    }
}

/// Result of the reachability prober.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Unknown = 0,
    Yes = 1,
    No = 2,
}

/// Session stale when this much time passed since the last success while
/// the socket still reports connected.
pub const STALE_AFTER: Duration = Duration::from_secs(120);
/// Suspect-stale polls before a forced restart.
pub const SUSPECT_LIMIT: u32 = 3;
/// Consecutive ticket errors above this bound force a restart.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;
/// Pause between a forced close and re-entering the state machine.
pub const RESTART_PAUSE: Duration = Duration::from_secs(1);

/// Reconnect delay for the `n`th consecutive failure: `min(2^n, 30)` s.
pub fn backoff_delay(failures: u32) -> Duration {
    if failures >= 5 {
        Duration::from_secs(30)
    } else {
        Duration::from_secs(1u64 << failures)
    }
}

#[derive(Debug)]
pub struct SessionState {
    phase: AtomicU8,
    reachable: AtomicU8,
    negotiated_pdu: AtomicU16,
    consecutive_errors: AtomicU32,
    last_success: Mutex<Option<Instant>>,
    active_profile: Mutex<Option<TsapProfile>>,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState {
            phase: AtomicU8::new(Phase::Disconnected as u8),
            reachable: AtomicU8::new(Reachability::Unknown as u8),
            negotiated_pdu: AtomicU16::new(0),
            consecutive_errors: AtomicU32::new(0),
            last_success: Mutex::new(None),
            active_profile: Mutex::new(None),
        }
    }
}

impl SessionState {
    pub fn new() -> Self {
        SessionState::default()
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Ready
    }

    pub fn reachable(&self) -> Reachability {
        match self.reachable.load(Ordering::Acquire) {
            1 => Reachability::Yes,
            2 => Reachability::No,
            _ => Reachability::Unknown,
        }
    }

    pub fn set_reachable(&self, r: Reachability) {
        self.reachable.store(r as u8, Ordering::Release);
    }

    pub fn negotiated_pdu(&self) -> u16 {
        self.negotiated_pdu.load(Ordering::Acquire)
    }

    pub fn set_negotiated_pdu(&self, pdu: u16) {
        self.negotiated_pdu.store(pdu, Ordering::Release);
    }

    pub fn active_profile(&self) -> Option<TsapProfile> {
        self.active_profile.lock().ok().and_then(|p| *p)
    }

    pub fn set_active_profile(&self, profile: Option<TsapProfile>) {
        if let Ok(mut p) = self.active_profile.lock() {
            *p = profile;
        }
    }

    /// Record a successful exchange: resets the error cluster and stamps
    /// the staleness clock.
    pub fn mark_success(&self) {
        self.consecutive_errors.store(0, Ordering::Release);
        if let Ok(mut t) = self.last_success.lock() {
            *t = Some(Instant::now());
        }
    }

    /// Record a failed exchange; returns the new cluster size.
    pub fn mark_error(&self) -> u32 {
        self.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Acquire)
    }

    pub fn since_last_success(&self) -> Option<Duration> {
        self.last_success
            .lock()
            .ok()
            .and_then(|t| t.map(|t| t.elapsed()))
    }
}
