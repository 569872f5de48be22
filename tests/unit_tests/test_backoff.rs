// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use s7_client_rs::client::session::{
    Phase, Reachability, SessionState, backoff_delay,
};

#[test]
fn backoff_is_exponential_and_capped() {
    for k in 0u32..12 {
        let expected = Duration::from_secs((1u64 << k.min(10)).min(30));
        assert_eq!(backoff_delay(k), expected, "k={k}");
    }
    assert_eq!(backoff_delay(1), Duration::from_secs(2));
    assert_eq!(backoff_delay(4), Duration::from_secs(16));
    assert_eq!(backoff_delay(5), Duration::from_secs(30));
    assert_eq!(backoff_delay(100), Duration::from_secs(30));
}

#[test]
fn session_phase_transitions() {
    let s = SessionState::new();
    assert_eq!(s.phase(), Phase::Disconnected);
    assert!(!s.is_ready());

    s.set_phase(Phase::TcpConnecting);
    s.set_phase(Phase::IsoHandshake);
    s.set_phase(Phase::CommSetup);
    s.set_phase(Phase::Ready);
    assert!(s.is_ready());

    s.set_phase(Phase::Closing);
    assert!(!s.is_ready());
}

#[test]
fn error_cluster_counting() {
    let s = SessionState::new();
    assert_eq!(s.mark_error(), 1);
    assert_eq!(s.mark_error(), 2);
    assert_eq!(s.consecutive_errors(), 2);

    s.mark_success();
    assert_eq!(s.consecutive_errors(), 0);
    assert!(s.since_last_success().expect("stamped") < Duration::from_secs(1));
}

#[test]
fn reachability_tracking() {
    let s = SessionState::new();
    assert_eq!(s.reachable(), Reachability::Unknown);
    s.set_reachable(Reachability::Yes);
    assert_eq!(s.reachable(), Reachability::Yes);
    s.set_reachable(Reachability::No);
    assert_eq!(s.reachable(), Reachability::No);
}

#[test]
fn negotiated_pdu_storage() {
    let s = SessionState::new();
    assert_eq!(s.negotiated_pdu(), 0);
    s.set_negotiated_pdu(480);
    assert_eq!(s.negotiated_pdu(), 480);
}
