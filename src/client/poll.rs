// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The polling engine.
//!
//! Every tick it snapshots the pollable tags, dispatches pending writes,
//! reads each tag through the dispatcher queue and publishes change events
//! plus the scan duration. A synchronous read-through caller raises the
//! pause flag and waits for the engine to acknowledge via the `paused`
//! watch channel; the engine acknowledges at the next tick or between two
//! tags of a running scan, so the caller never races it on the socket.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    client::{dispatcher::DispatcherHandle, session::SessionState},
    error::S7Error,
    events::EventHub,
    tags::{Tag, TagTable},
    values::{decode_value, encode_value},
};

pub struct PollEngine {
    pub interval: Duration,
    pub tags: Arc<TagTable>,
    pub dispatcher: DispatcherHandle,
    pub session: Arc<SessionState>,
    pub events: Arc<EventHub>,
    pub pause_requested: Arc<AtomicBool>,
    pub cancel: CancellationToken,
}

impl PollEngine {
    pub fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {},
            }

            if !self.session.is_ready() {
                continue;
            }

            let snapshot = self.tags.snapshot_pollable();
            if snapshot.is_empty() || self.pause_requested.load(Ordering::Acquire) {
                self.events.set_paused(true);
                continue;
            }
            self.events.set_paused(false);

            let started = Instant::now();
            for name in snapshot {
                if self.cancel.is_cancelled() {
                    return;
                }
                // Yield to a waiting synchronous reader between tags.
                if self.pause_requested.load(Ordering::Acquire) {
                    self.events.set_paused(true);
                    break;
                }
                self.flush_pending(&name).await;
                if !self.scan_one(&name).await {
                    break;
                }
            }
            self.events.publish_scan_time(started.elapsed());
        }
    }

    /// Dispatch a queued write before the tag is read back. The pending
    /// value is consumed on success and restored on failure.
    async fn flush_pending(&self, name: &str) {
        let Some((tag, value)) = self.tags.take_pending(name) else {
            return;
        };
        match write_tag(&self.dispatcher, &tag, &value).await {
            Ok(()) => debug!("wrote pending value of {}", tag.name),
            Err(e) => {
                warn!("pending write of {} failed: {e}", tag.name);
                let _ = self.tags.set_pending(name, value);
            },
        }
    }

    /// Read one tag and publish its change event. Returns false when the
    /// scan should stop (session dropped out of Ready).
    async fn scan_one(&self, name: &str) -> bool {
        let Some(tag) = self.tags.get(name) else {
            // Removed between snapshot and scan.
            return true;
        };

        match self.dispatcher.read(tag.var_spec()).await {
            Ok(data) => {
                match decode_value(tag.ty, tag.array_length, &data, 0) {
                    Ok(value) => {
                        match self.tags.store_decoded(name, value.clone()) {
                            Ok(true) => self.events.publish_value(&tag.name, value),
                            Ok(false) => {},
                            Err(e) => self.events.publish_error(&e),
                        }
                    },
                    Err(e) => {
                        // Wire data that does not fit the declared type: a
                        // data error, the session stays up.
                        self.events.publish_error(&e);
                    },
                }
                true
            },
            Err(S7Error::Cancelled) => false,
            Err(_) => {
                // The dispatcher already published the error; a dead session
                // ends this scan early.
                self.session.is_ready()
            },
        }
    }
}

/// Encode and dispatch one write covering the whole tag.
pub async fn write_tag(
    dispatcher: &DispatcherHandle,
    tag: &Tag,
    value: &crate::values::S7Value,
) -> Result<(), S7Error> {
    let payload = encode_value(tag.ty, tag.array_length, value)?;
    dispatcher.write(tag.var_spec(), payload).await
}
