// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The client instance: one PLC, one session, one socket.
//!
//! `PlcClient::new` spawns the dispatcher (sole socket owner), the
//! supervisor (connection state machine, reconnect backoff, stale
//! detection, circuit-breaker restart), the polling engine and, when
//! configured, the watchdog writer. All of them run under child
//! cancellation tokens of the instance; `close()` tears everything down in
//! bounded time and is idempotent.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::Config,
    client::{
        dispatcher::{CpuStatus, Dispatcher, DispatcherHandle},
        poll::{PollEngine, write_tag},
        session::{
            MAX_CONSECUTIVE_ERRORS, Phase, RESTART_PAUSE, STALE_AFTER, SUSPECT_LIMIT,
            SessionState, backoff_delay,
        },
        watchdog::Watchdog,
    },
    error::S7Error,
    events::{EventHub, LastError, TagUpdate, ValueObserver},
    frames::{
        control::PiOutcome,
        szl::{SZL_ID_COMPONENT_ID, SZL_ID_MODULE_ID},
    },
    metrics::{Metrics, MetricsSnapshot},
    state_machine::{common::StateMachineCtx, connect_states::ConnectCtx},
    tags::TagTable,
    values::{S7Value, TagType},
};

/// Cadence of the Ready-phase health check.
const MONITOR_TICK: Duration = Duration::from_secs(1);

pub struct PlcClient {
    cfg: Config,
    session: Arc<SessionState>,
    metrics: Arc<Metrics>,
    events: Arc<EventHub>,
    tags: Arc<TagTable>,
    dispatcher: DispatcherHandle,
    pause_requested: Arc<AtomicBool>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl PlcClient {
    /// Validate the configuration and bring the instance up. The returned
    /// client is immediately usable; the session connects in the
    /// background.
    pub fn new(cfg: Config) -> anyhow::Result<Arc<Self>> {
        cfg.validate()?;

        let session = Arc::new(SessionState::new());
        let metrics = Arc::new(Metrics::new());
        let events = Arc::new(EventHub::new());
        let tags = Arc::new(TagTable::new());
        let pause_requested = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let dispatcher = Dispatcher::spawn(
            cfg.plc.ip,
            cfg.plc.port,
            cfg.plc.rack,
            cfg.plc.slot,
            cfg.runtime.socket_timeout,
            cfg.runtime.ticket_deadline,
            Arc::clone(&session),
            Arc::clone(&metrics),
            Arc::clone(&events),
            cancel.child_token(),
        );

        let client = Arc::new(PlcClient {
            cfg,
            session,
            metrics,
            events,
            tags,
            dispatcher,
            pause_requested,
            cancel,
            closed: AtomicBool::new(false),
        });

        client.spawn_supervisor();
        client.spawn_poller();
        client.spawn_watchdog()?;

        Ok(client)
    }

    fn spawn_supervisor(self: &Arc<Self>) {
        let supervisor = Supervisor {
            cfg: self.cfg.clone(),
            dispatcher: self.dispatcher.clone(),
            session: Arc::clone(&self.session),
            events: Arc::clone(&self.events),
        };
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            supervisor.run(cancel).await;
        });
    }

    fn spawn_poller(self: &Arc<Self>) {
        PollEngine {
            interval: self.cfg.polling.interval,
            tags: Arc::clone(&self.tags),
            dispatcher: self.dispatcher.clone(),
            session: Arc::clone(&self.session),
            events: Arc::clone(&self.events),
            pause_requested: Arc::clone(&self.pause_requested),
            cancel: self.cancel.child_token(),
        }
        .spawn();
    }

    fn spawn_watchdog(self: &Arc<Self>) -> anyhow::Result<()> {
        if let Some(wd_cfg) = &self.cfg.watchdog {
            Watchdog::from_config(
                wd_cfg,
                self.dispatcher.clone(),
                Arc::clone(&self.session),
                self.cancel.child_token(),
            )
            .map_err(|e| anyhow::anyhow!("watchdog config: {e}"))?
            .spawn();
        }
        Ok(())
    }

    fn set_phase(&self, phase: Phase) {
        self.session.set_phase(phase);
        self.events.set_phase(phase);
    }

    // ── tag surface ─────────────────────────────────────────────────────

    /// Register a tag or update its declaration.
    pub fn declare_tag(
        &self,
        name: &str,
        address: &str,
        ty: TagType,
        array_length: u16,
        do_not_poll: bool,
    ) -> Result<(), S7Error> {
        self.tags
            .insert_or_update(name, address, ty, array_length, do_not_poll)
    }

    pub fn remove_tag(&self, name: &str) -> bool {
        self.tags.remove(name)
    }

    /// Synchronous read-through.
    ///
    /// Pauses the polling engine first (bounded by one poll interval), so
    /// the caller never interleaves with a scan on the same session, then
    /// reads the tag, stores the value and emits its change event.
    pub async fn read_value(&self, name: &str) -> Result<S7Value, S7Error> {
        let tag = self
            .tags
            .get(name)
            .ok_or_else(|| S7Error::UnknownTag(name.to_string()))?;

        self.pause_requested.store(true, Ordering::Release);
        let result = async {
            self.await_paused().await;
            let data = self.dispatcher.read(tag.var_spec()).await?;
            let value = crate::values::decode_value(tag.ty, tag.array_length, &data, 0)?;
            if self.tags.store_decoded(name, value.clone())? {
                self.events.publish_value(&tag.name, value.clone());
            }
            Ok(value)
        }
        .await;
        self.pause_requested.store(false, Ordering::Release);
        result
    }

    /// Wait until the polling engine acknowledges the pause. A dead or idle
    /// poller acknowledges by not scanning at all; the wait is bounded by
    /// two poll intervals.
    async fn await_paused(&self) {
        let mut paused = self.events.observe_paused();
        if *paused.borrow() {
            return;
        }
        let bound = self.cfg.polling.interval * 2;
        let _ = timeout(bound, async {
            while paused.changed().await.is_ok() {
                if *paused.borrow() {
                    break;
                }
            }
        })
        .await;
    }

    /// Fire-and-forget write: queues the value as the tag's pending value
    /// and dispatches it immediately. Errors surface on the error streams;
    /// the stored value converges at the next poll.
    pub fn write_value(self: &Arc<Self>, name: &str, value: S7Value) -> Result<(), S7Error> {
        // Validate against the declaration before queueing.
        let tag = self
            .tags
            .get(name)
            .ok_or_else(|| S7Error::UnknownTag(name.to_string()))?;
        crate::values::encode_value(tag.ty, tag.array_length, &value)?;
        self.tags.set_pending(name, value)?;

        let client = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            let Some((tag, value)) = client.tags.take_pending(&name) else {
                return;
            };
            if let Err(e) = write_tag(&client.dispatcher, &tag, &value).await {
                // Dispatcher-level errors are already on the streams; keep
                // the value queued for the polling engine to retry.
                warn!("write of {} failed: {e}", tag.name);
                let _ = client.tags.set_pending(&name, value);
            }
        });
        Ok(())
    }

    // ── observers ───────────────────────────────────────────────────────

    pub fn observe_value(&self, name: &str) -> ValueObserver {
        self.events.observe_value(name)
    }

    pub fn observe_all(&self) -> tokio::sync::broadcast::Receiver<TagUpdate> {
        self.events.observe_all()
    }

    pub fn observe_connected(&self) -> tokio::sync::watch::Receiver<bool> {
        self.events.observe_connected()
    }

    pub fn observe_status(&self) -> tokio::sync::watch::Receiver<Phase> {
        self.events.observe_status()
    }

    pub fn observe_read_time(&self) -> tokio::sync::broadcast::Receiver<Duration> {
        self.events.observe_read_time()
    }

    pub fn observe_errors(&self) -> tokio::sync::broadcast::Receiver<String> {
        self.events.observe_errors()
    }

    pub fn observe_error_codes(
        &self,
    ) -> tokio::sync::broadcast::Receiver<crate::error::ErrorCode> {
        self.events.observe_error_codes()
    }

    pub fn observe_last_error(&self) -> tokio::sync::watch::Receiver<Option<LastError>> {
        self.events.observe_last_error()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn phase(&self) -> Phase {
        self.session.phase()
    }

    pub fn negotiated_pdu(&self) -> u16 {
        self.session.negotiated_pdu()
    }

    // ── CPU services ────────────────────────────────────────────────────

    /// CPU identity lines decoded from SZL 0x001C and 0x0011.
    pub async fn get_cpu_info(&self) -> Result<Vec<String>, S7Error> {
        let component = self.dispatcher.szl(SZL_ID_COMPONENT_ID, 0).await?;
        let ident = self.dispatcher.szl(SZL_ID_MODULE_ID, 0).await?;

        let mut info = Vec::with_capacity(7);
        info.push(format!("AS name: {}", ascii_field(&component, 2, 26)?));
        info.push(format!("Module name: {}", ascii_field(&component, 36, 60)?));
        info.push(format!("Copyright: {}", ascii_field(&component, 104, 130)?));
        info.push(format!("Serial number: {}", ascii_field(&component, 138, 162)?));
        info.push(format!("Module type: {}", ascii_field(&component, 172, 204)?));
        info.push(format!("Order code: {}", ascii_field(&ident, 2, 22)?));

        if ident.len() < 3 {
            return Err(S7Error::ShortFrame {
                need: 3,
                got: ident.len(),
            });
        }
        let tail = &ident[ident.len() - 3..];
        info.push(format!("Version: {}.{}.{}", tail[0], tail[1], tail[2]));
        Ok(info)
    }

    /// Warm start (`plc_start`): program processing resumes.
    pub async fn plc_start(&self) -> Result<PiOutcome, S7Error> {
        let outcome = self.dispatcher.pi_start(false).await?;
        if outcome == PiOutcome::AlreadyInState {
            info!("CPU already in run mode");
        }
        Ok(outcome)
    }

    /// Cold start: configuration discarded, initial values reloaded.
    pub async fn plc_cold_start(&self) -> Result<PiOutcome, S7Error> {
        let outcome = self.dispatcher.pi_start(true).await?;
        if outcome == PiOutcome::AlreadyInState {
            info!("CPU already in run mode");
        }
        Ok(outcome)
    }

    pub async fn plc_stop(&self) -> Result<PiOutcome, S7Error> {
        let outcome = self.dispatcher.pi_stop().await?;
        if outcome == PiOutcome::AlreadyInState {
            info!("CPU already in stop mode");
        }
        Ok(outcome)
    }

    pub async fn plc_status(&self) -> Result<CpuStatus, S7Error> {
        self.dispatcher.cpu_state().await
    }

    // ── lifecycle ───────────────────────────────────────────────────────

    /// Dispose the instance: cancels every task, completes queued tickets
    /// with `Cancelled` and closes the socket. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_phase(Phase::Closing);
        self.cancel.cancel();
        self.session.set_phase(Phase::Disconnected);
        debug!("client closed");
    }
}

impl Drop for PlcClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// The connection supervisor: a child task that brings the session to
/// Ready, watches it, and rebuilds it on error clusters and staleness. It
/// owns clones of the shared pieces only, never the client itself.
struct Supervisor {
    cfg: Config,
    dispatcher: DispatcherHandle,
    session: Arc<SessionState>,
    events: Arc<EventHub>,
}

impl Supervisor {
    async fn run(&self, cancel: CancellationToken) {
        let mut failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let mut ctx = ConnectCtx::new(
                self.dispatcher.clone(),
                self.cfg.plc.ip,
                self.cfg.plc.port,
                self.cfg.plc.cpu_type,
                self.cfg.runtime.probe_timeout,
                Arc::clone(&self.session),
                Arc::clone(&self.events),
            );
            match ctx.execute(&cancel).await {
                Ok(()) => {
                    failures = 0;
                    self.monitor_ready(&cancel).await;
                    if cancel.is_cancelled() {
                        return;
                    }
                },
                Err(S7Error::Cancelled) => return,
                Err(e) => {
                    failures += 1;
                    // Damped logging: the first five attempts, then every
                    // tenth.
                    if failures <= 5 || failures % 10 == 0 {
                        warn!("connection attempt {failures} failed: {e}");
                    }
                    self.set_phase(Phase::Degraded);
                    let delay = backoff_delay(failures);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(delay) => {},
                    }
                    self.set_phase(Phase::Disconnected);
                },
            }
        }
    }

    /// Ready-phase health loop: leaves when the session drops out of
    /// Ready, when errors cluster, or when three stale checks in a row
    /// stay suspect.
    async fn monitor_ready(&self, cancel: &CancellationToken) {
        let mut suspects = 0u32;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(MONITOR_TICK) => {},
            }

            if self.session.phase() != Phase::Ready {
                // The dispatcher lost the socket; reconnect.
                return;
            }

            if self.session.consecutive_errors() > MAX_CONSECUTIVE_ERRORS {
                warn!(
                    "{} consecutive errors, forcing session restart",
                    self.session.consecutive_errors()
                );
                self.force_restart(cancel).await;
                return;
            }

            match self.session.since_last_success() {
                Some(idle) if idle > STALE_AFTER => {
                    suspects += 1;
                    debug!("session suspect-stale ({suspects}/{SUSPECT_LIMIT})");
                    // Keep-alive touch; success resets the staleness clock.
                    let _ = self.dispatcher.sentinel().await;
                    if suspects >= SUSPECT_LIMIT {
                        warn!("stale session, forcing restart");
                        self.force_restart(cancel).await;
                        return;
                    }
                },
                _ => suspects = 0,
            }
        }
    }

    async fn force_restart(&self, cancel: &CancellationToken) {
        self.set_phase(Phase::Degraded);
        self.dispatcher.close_socket().await;
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(RESTART_PAUSE) => {},
        }
        self.set_phase(Phase::Disconnected);
    }

    fn set_phase(&self, phase: Phase) {
        self.session.set_phase(phase);
        self.events.set_phase(phase);
    }
}

/// ASCII slice of an SZL record area, NUL/space-trimmed.
fn ascii_field(data: &[u8], from: usize, to: usize) -> Result<String, S7Error> {
    let slice = data.get(from..to).ok_or_else(|| S7Error::ShortFrame {
        need: to,
        got: data.len(),
    })?;
    Ok(String::from_utf8_lossy(slice)
        .trim_end_matches(['\0', ' '])
        .to_string())
}
