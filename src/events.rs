// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The reactive surface of a client instance.
//!
//! Every stream is hot: late subscribers see only future events. Value
//! changes and scan durations fan out over broadcast channels; connection
//! phase, pause state and the latest error live in watch channels so a new
//! subscriber immediately sees the current state.

use std::time::Duration;

use tokio::sync::{broadcast, watch};

use crate::{
    client::session::Phase,
    error::{ErrorCode, S7Error},
    values::S7Value,
};

const CHANNEL_CAPACITY: usize = 256;

/// One tag change event.
#[derive(Debug, Clone)]
pub struct TagUpdate {
    pub name: String,
    pub value: S7Value,
}

/// Latest published error, kept for late subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug)]
pub struct EventHub {
    values: broadcast::Sender<TagUpdate>,
    read_time: broadcast::Sender<Duration>,
    errors_msg: broadcast::Sender<String>,
    errors_code: broadcast::Sender<ErrorCode>,
    connected: watch::Sender<bool>,
    status: watch::Sender<Phase>,
    last_error: watch::Sender<Option<LastError>>,
    paused: watch::Sender<bool>,
}

impl Default for EventHub {
    fn default() -> Self {
        EventHub {
            values: broadcast::channel(CHANNEL_CAPACITY).0,
            read_time: broadcast::channel(CHANNEL_CAPACITY).0,
            errors_msg: broadcast::channel(CHANNEL_CAPACITY).0,
            errors_code: broadcast::channel(CHANNEL_CAPACITY).0,
            connected: watch::channel(false).0,
            status: watch::channel(Phase::Disconnected).0,
            last_error: watch::channel(None).0,
            paused: watch::channel(false).0,
        }
    }
}

impl EventHub {
    pub fn new() -> Self {
        EventHub::default()
    }

    pub fn publish_value(&self, name: &str, value: S7Value) {
        let _ = self.values.send(TagUpdate {
            name: name.to_string(),
            value,
        });
    }

    pub fn publish_scan_time(&self, took: Duration) {
        let _ = self.read_time.send(took);
    }

    /// Publish one error on both streams and refresh the last-error view.
    /// Each error reaches every subscriber exactly once.
    pub fn publish_error(&self, err: &S7Error) {
        let code = err.code();
        let message = err.to_string();
        let _ = self.errors_msg.send(message.clone());
        let _ = self.errors_code.send(code);
        self.last_error.send_replace(Some(LastError { code, message }));
    }

    pub fn set_phase(&self, phase: Phase) {
        self.status.send_if_modified(|p| {
            if *p == phase {
                return false;
            }
            *p = phase;
            true
        });
        let connected = phase == Phase::Ready;
        self.connected.send_if_modified(|c| {
            if *c == connected {
                return false;
            }
            *c = connected;
            true
        });
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.send_replace(paused);
    }

    pub fn observe_all(&self) -> broadcast::Receiver<TagUpdate> {
        self.values.subscribe()
    }

    /// Filtered projection of [`EventHub::observe_all`] onto one tag name.
    pub fn observe_value(&self, name: &str) -> ValueObserver {
        ValueObserver {
            name: name.to_ascii_uppercase(),
            rx: self.values.subscribe(),
        }
    }

    pub fn observe_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn observe_status(&self) -> watch::Receiver<Phase> {
        self.status.subscribe()
    }

    pub fn observe_read_time(&self) -> broadcast::Receiver<Duration> {
        self.read_time.subscribe()
    }

    pub fn observe_errors(&self) -> broadcast::Receiver<String> {
        self.errors_msg.subscribe()
    }

    pub fn observe_error_codes(&self) -> broadcast::Receiver<ErrorCode> {
        self.errors_code.subscribe()
    }

    pub fn observe_last_error(&self) -> watch::Receiver<Option<LastError>> {
        self.last_error.subscribe()
    }

    pub fn observe_paused(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }
}

/// A hot stream of one tag's change events.
#[derive(Debug)]
pub struct ValueObserver {
    name: String,
    rx: broadcast::Receiver<TagUpdate>,
}

impl ValueObserver {
    /// Next change of the observed tag, or `None` once the hub is gone.
    /// Missed events under lag are skipped, matching hot-stream semantics.
    pub async fn recv(&mut self) -> Option<S7Value> {
        loop {
            match self.rx.recv().await {
                Ok(update) if update.name.eq_ignore_ascii_case(&self.name) => {
                    return Some(update.value);
                },
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
