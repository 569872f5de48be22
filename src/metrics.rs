// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-instance running counters and rolling latency windows.
//!
//! Counters are plain atomics; the two latency windows are bounded at 100
//! samples and live under their own mutex. `snapshot()` yields an immutable
//! copy that is safe to publish.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

/// Bound of each rolling latency window.
const WINDOW: usize = 100;

#[derive(Debug, Default)]
pub struct Metrics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    operation_count: AtomicU64,
    error_count: AtomicU64,
    windows: Mutex<Windows>,
}

#[derive(Debug, Default)]
struct Windows {
    send: VecDeque<Duration>,
    receive: VecDeque<Duration>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn record_sent(&self, bytes: usize, took: Duration) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        if let Ok(mut w) = self.windows.lock() {
            push_bounded(&mut w.send, took);
        }
    }

    pub fn record_received(&self, bytes: usize, took: Duration) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
        if let Ok(mut w) = self.windows.lock() {
            push_bounded(&mut w.receive, took);
        }
    }

    pub fn record_operation(&self) {
        self.operation_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Immutable copy of all counters and window-derived averages.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (average_send, average_receive, recent_send, recent_receive) =
            match self.windows.lock() {
                Ok(w) => (
                    average(&w.send),
                    average(&w.receive),
                    w.send.iter().copied().collect(),
                    w.receive.iter().copied().collect(),
                ),
                Err(_) => (Duration::ZERO, Duration::ZERO, Vec::new(), Vec::new()),
            };

        let operation_count = self.operation_count.load(Ordering::Relaxed);
        let error_count = self.error_count.load(Ordering::Relaxed);
        MetricsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            operation_count,
            error_count,
            error_rate: if operation_count == 0 {
                0.0
            } else {
                error_count as f64 / operation_count as f64
            },
            average_send,
            average_receive,
            recent_send,
            recent_receive,
        }
    }
}

/// Frozen view of the metrics at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub operation_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub average_send: Duration,
    pub average_receive: Duration,
    pub recent_send: Vec<Duration>,
    pub recent_receive: Vec<Duration>,
}

fn push_bounded(window: &mut VecDeque<Duration>, sample: Duration) {
    if window.len() == WINDOW {
        window.pop_front();
    }
    window.push_back(sample);
}

fn average(window: &VecDeque<Duration>) -> Duration {
    if window.is_empty() {
        return Duration::ZERO;
    }
    let total: Duration = window.iter().sum();
    total / window.len() as u32
}
