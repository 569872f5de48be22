// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The request dispatcher: a single cooperative loop holding the sole
//! capability to touch the socket.
//!
//! Requests arrive as tickets on an MPSC queue and complete in FIFO order;
//! exactly one S7 exchange is in flight at any time (the protocol does not
//! interleave safely on one session). The connection state machine opens and
//! closes the socket through control commands on the same queue, so there is
//! never a second owner.
//!
//! Large reads are split into `pdu_length - 32` chunks at adjacent offsets,
//! each retried up to three times; writes are split into 200-byte chunks of
//! the same DB. An SZL query runs as one ticket that internally issues the
//! whole continuation sequence.

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, timeout_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    client::{
        session::{Phase, SessionState},
        transport::PlcTransport,
    },
    error::S7Error,
    events::EventHub,
    frames::{
        control::{
            FUNC_PI_START, FUNC_PI_STOP, PiOutcome, build_cold_start, build_stop,
            build_warm_start, parse_pi_response,
        },
        cotp::{self, TsapProfile},
        setup,
        szl::{self, SZL_ID_CPU_STATE, SZL_ID_MODULE_ID},
        var::{VarSpec, build_read_var, build_write_var, parse_read_var_response,
              parse_write_var_response},
    },
    metrics::Metrics,
};

/// Read chunk bound: the negotiated PDU minus the exchange overhead.
pub const READ_OVERHEAD: u16 = 32;
/// Writes never carry more than this many payload bytes per request.
pub const WRITE_CHUNK_MAX: u16 = 200;
/// Attempts per chunk before the ticket fails.
const CHUNK_RETRIES: u32 = 3;
/// Continuation frames an SZL query may consume before it is cut off.
const SZL_CHUNK_LIMIT: u32 = 255;

/// CPU operating state decoded from SZL 0x0424.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuStatus {
    Run,
    Stop,
    Unknown,
}

/// Work accepted by the dispatcher.
#[derive(Debug)]
pub enum TicketKind {
    Read { spec: VarSpec },
    Write { spec: VarSpec, payload: Vec<u8> },
    Szl { id: u16, index: u16 },
    /// Keep-alive touch on a suspect-stale session.
    Sentinel,
    PiStart { cold: bool },
    PiStop,
    CpuState,
}

/// Completion payload of a ticket.
#[derive(Debug)]
pub enum Reply {
    Data(Bytes),
    Written,
    Szl(Vec<u8>),
    Pi(PiOutcome),
    CpuState(CpuStatus),
    Touched,
}

/// An ephemeral request: allocated by the caller, owned by the dispatcher
/// until its completion channel fires.
#[derive(Debug)]
pub struct Ticket {
    pub kind: TicketKind,
    pub deadline: Instant,
    pub done: oneshot::Sender<Result<Reply, S7Error>>,
}

/// Queue entries: I/O tickets plus the state machine's socket controls.
#[derive(Debug)]
pub enum Command {
    Ticket(Ticket),
    OpenSocket {
        pdu_hint: u16,
        done: oneshot::Sender<Result<(), S7Error>>,
    },
    IsoHandshake {
        profile: TsapProfile,
        done: oneshot::Sender<Result<(), S7Error>>,
    },
    CommSetup {
        requested_pdu: u16,
        done: oneshot::Sender<Result<u16, S7Error>>,
    },
    CloseSocket {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable sender side of the dispatcher queue.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Command>,
    ticket_deadline: Duration,
}

impl DispatcherHandle {
    async fn submit(&self, kind: TicketKind, deadline: Instant) -> Result<Reply, S7Error> {
        let (done, rx) = oneshot::channel();
        let ticket = Ticket {
            kind,
            deadline,
            done,
        };
        self.tx
            .send(Command::Ticket(ticket))
            .await
            .map_err(|_| S7Error::Cancelled)?;
        rx.await.map_err(|_| S7Error::Cancelled)?
    }

    fn default_deadline(&self) -> Instant {
        Instant::now() + self.ticket_deadline
    }

    pub async fn read(&self, spec: VarSpec) -> Result<Bytes, S7Error> {
        match self
            .submit(TicketKind::Read { spec }, self.default_deadline())
            .await?
        {
            Reply::Data(data) => Ok(data),
            _ => Err(S7Error::ReadData),
        }
    }

    pub async fn write(&self, spec: VarSpec, payload: Vec<u8>) -> Result<(), S7Error> {
        match self
            .submit(TicketKind::Write { spec, payload }, self.default_deadline())
            .await?
        {
            Reply::Written => Ok(()),
            _ => Err(S7Error::WriteData),
        }
    }

    pub async fn szl(&self, id: u16, index: u16) -> Result<Vec<u8>, S7Error> {
        match self
            .submit(TicketKind::Szl { id, index }, self.default_deadline())
            .await?
        {
            Reply::Szl(data) => Ok(data),
            _ => Err(S7Error::ReadData),
        }
    }

    pub async fn sentinel(&self) -> Result<(), S7Error> {
        self.submit(TicketKind::Sentinel, self.default_deadline())
            .await
            .map(|_| ())
    }

    pub async fn pi_start(&self, cold: bool) -> Result<PiOutcome, S7Error> {
        match self
            .submit(TicketKind::PiStart { cold }, self.default_deadline())
            .await?
        {
            Reply::Pi(outcome) => Ok(outcome),
            _ => Err(S7Error::WriteData),
        }
    }

    pub async fn pi_stop(&self) -> Result<PiOutcome, S7Error> {
        match self.submit(TicketKind::PiStop, self.default_deadline()).await? {
            Reply::Pi(outcome) => Ok(outcome),
            _ => Err(S7Error::WriteData),
        }
    }

    pub async fn cpu_state(&self) -> Result<CpuStatus, S7Error> {
        match self
            .submit(TicketKind::CpuState, self.default_deadline())
            .await?
        {
            Reply::CpuState(state) => Ok(state),
            _ => Err(S7Error::ReadData),
        }
    }

    pub async fn open_socket(&self, pdu_hint: u16) -> Result<(), S7Error> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::OpenSocket { pdu_hint, done })
            .await
            .map_err(|_| S7Error::Cancelled)?;
        rx.await.map_err(|_| S7Error::Cancelled)?
    }

    pub async fn iso_handshake(&self, profile: TsapProfile) -> Result<(), S7Error> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::IsoHandshake { profile, done })
            .await
            .map_err(|_| S7Error::Cancelled)?;
        rx.await.map_err(|_| S7Error::Cancelled)?
    }

    pub async fn comm_setup(&self, requested_pdu: u16) -> Result<u16, S7Error> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::CommSetup {
                requested_pdu,
                done,
            })
            .await
            .map_err(|_| S7Error::Cancelled)?;
        rx.await.map_err(|_| S7Error::Cancelled)?
    }

    pub async fn close_socket(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(Command::CloseSocket { done }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Dispatcher task state.
pub struct Dispatcher {
    rx: mpsc::Receiver<Command>,
    transport: Option<PlcTransport>,
    ip: Ipv4Addr,
    port: u16,
    rack: u8,
    slot: u8,
    socket_timeout: Duration,
    session: Arc<SessionState>,
    metrics: Arc<Metrics>,
    events: Arc<EventHub>,
    cancel: CancellationToken,
    pdu_ref: u16,
}

impl Dispatcher {
    /// Spawn the dispatcher loop and return its handle.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        ip: Ipv4Addr,
        port: u16,
        rack: u8,
        slot: u8,
        socket_timeout: Duration,
        ticket_deadline: Duration,
        session: Arc<SessionState>,
        metrics: Arc<Metrics>,
        events: Arc<EventHub>,
        cancel: CancellationToken,
    ) -> DispatcherHandle {
        let (tx, rx) = mpsc::channel(64);
        let dispatcher = Dispatcher {
            rx,
            transport: None,
            ip,
            port,
            rack,
            slot,
            socket_timeout,
            session,
            metrics,
            events,
            cancel,
            pdu_ref: 1,
        };
        tokio::spawn(dispatcher.run());
        DispatcherHandle {
            tx,
            ticket_deadline,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.drain_cancelled();
                    return;
                },
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => return,
                },
            }
        }
    }

    /// Complete everything still queued with `Cancelled`.
    fn drain_cancelled(&mut self) {
        self.transport = None;
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                Command::Ticket(t) => {
                    let _ = t.done.send(Err(S7Error::Cancelled));
                },
                Command::OpenSocket { done, .. } => {
                    let _ = done.send(Err(S7Error::Cancelled));
                },
                Command::IsoHandshake { done, .. } => {
                    let _ = done.send(Err(S7Error::Cancelled));
                },
                Command::CommSetup { done, .. } => {
                    let _ = done.send(Err(S7Error::Cancelled));
                },
                Command::CloseSocket { done } => {
                    let _ = done.send(());
                },
            }
        }
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Ticket(ticket) => self.handle_ticket(ticket).await,
            Command::OpenSocket { pdu_hint, done } => {
                let res = self.open_socket(pdu_hint).await;
                let _ = done.send(res);
            },
            Command::IsoHandshake { profile, done } => {
                let res = self.iso_handshake(profile).await;
                let _ = done.send(res);
            },
            Command::CommSetup {
                requested_pdu,
                done,
            } => {
                let res = self.comm_setup(requested_pdu).await;
                let _ = done.send(res);
            },
            Command::CloseSocket { done } => {
                self.transport = None;
                let _ = done.send(());
            },
        }
    }

    async fn handle_ticket(&mut self, ticket: Ticket) {
        let deadline = ticket.deadline;
        if Instant::now() >= deadline {
            self.complete(ticket.done, Err(S7Error::Timeout("ticket deadline")));
            return;
        }
        if !self.session.is_ready() || self.transport.is_none() {
            self.complete(
                ticket.done,
                Err(S7Error::ConnectionLost("session is not ready".to_string())),
            );
            return;
        }

        self.metrics.record_operation();
        let result = match timeout_at(deadline, self.execute(ticket.kind)).await {
            Ok(res) => res,
            Err(_) => {
                // The exchange was abandoned mid-flight; the stream state is
                // unknown, the session has to be rebuilt.
                self.lose_transport("ticket deadline expired mid-exchange");
                Err(S7Error::Timeout("ticket deadline"))
            },
        };
        self.complete(ticket.done, result);
    }

    fn complete(
        &self,
        done: oneshot::Sender<Result<Reply, S7Error>>,
        result: Result<Reply, S7Error>,
    ) {
        match &result {
            Ok(_) => self.session.mark_success(),
            Err(S7Error::Cancelled) => {},
            Err(e) => {
                self.metrics.record_error();
                self.session.mark_error();
                self.events.publish_error(e);
            },
        }
        let _ = done.send(result);
    }

    async fn execute(&mut self, kind: TicketKind) -> Result<Reply, S7Error> {
        match kind {
            TicketKind::Read { spec } => self.exec_read(spec).await.map(Reply::Data),
            TicketKind::Write { spec, payload } => {
                self.exec_write(spec, &payload).await.map(|_| Reply::Written)
            },
            TicketKind::Szl { id, index } => {
                self.exec_szl(id, index).await.map(Reply::Szl)
            },
            TicketKind::Sentinel => {
                self.exec_szl(SZL_ID_MODULE_ID, 0).await.map(|_| Reply::Touched)
            },
            TicketKind::PiStart { cold } => {
                let frame = if cold {
                    build_cold_start(self.next_ref())?
                } else {
                    build_warm_start(self.next_ref())?
                };
                let resp = self.round_trip(&frame).await?;
                parse_pi_response(&resp, FUNC_PI_START).map(Reply::Pi)
            },
            TicketKind::PiStop => {
                let frame = build_stop(self.next_ref())?;
                let resp = self.round_trip(&frame).await?;
                parse_pi_response(&resp, FUNC_PI_STOP).map(Reply::Pi)
            },
            TicketKind::CpuState => {
                let data = self.exec_szl(SZL_ID_CPU_STATE, 0).await?;
                let state = match data.get(3) {
                    Some(0x08) => CpuStatus::Run,
                    Some(0x04) => CpuStatus::Stop,
                    _ => CpuStatus::Unknown,
                };
                Ok(Reply::CpuState(state))
            },
        }
    }

    /// Read with transparent chunking and per-chunk retries; the result is
    /// the offset-contiguous concatenation of every chunk.
    async fn exec_read(&mut self, spec: VarSpec) -> Result<Bytes, S7Error> {
        // Bit and element reads fit a single exchange by construction.
        if spec.bit.is_some() || spec.area.is_indexed() {
            return self.read_single(spec).await;
        }

        let pdu = self.session.negotiated_pdu().max(setup::MIN_PDU_LEN);
        let chunks = read_chunk_plan(spec.start, spec.count, pdu);
        if chunks.len() == 1 {
            return self.read_single(spec).await;
        }

        debug!(
            "read of {} bytes split into {} chunks",
            spec.count,
            chunks.len()
        );
        let mut out = BytesMut::with_capacity(spec.count as usize);
        for (start, len) in chunks {
            let chunk_spec = VarSpec::bytes_at(spec.area, spec.db, start, len);
            let data = self.read_single(chunk_spec).await?;
            out.extend_from_slice(&data);
        }
        Ok(out.freeze())
    }

    async fn read_single(&mut self, spec: VarSpec) -> Result<Bytes, S7Error> {
        let mut last = None;
        for attempt in 1..=CHUNK_RETRIES {
            match self.read_once(spec).await {
                Ok(data) => return Ok(data),
                Err(e @ (S7Error::ConnectionLost(_) | S7Error::Cancelled)) => {
                    // Without a socket there is nothing left to retry.
                    return Err(e);
                },
                Err(e) => {
                    warn!("read chunk attempt {attempt}/{CHUNK_RETRIES} failed: {e}");
                    last = Some(e);
                },
            }
            if self.transport.is_none() {
                break;
            }
        }
        Err(last.unwrap_or(S7Error::ReadData))
    }

    async fn read_once(&mut self, spec: VarSpec) -> Result<Bytes, S7Error> {
        let frame = build_read_var(self.next_ref(), &[spec])?;
        let resp = self.round_trip(&frame).await?;
        let mut items = parse_read_var_response(&resp)?;
        if items.is_empty() {
            return Err(S7Error::ReadData);
        }
        items.remove(0).into_data()
    }

    /// Write with ≤ 200-byte chunking over byte-granular payloads.
    async fn exec_write(&mut self, spec: VarSpec, payload: &[u8]) -> Result<(), S7Error> {
        if spec.bit.is_some() || spec.area.is_indexed() {
            return self.write_single(spec, payload).await;
        }

        let mut offset = 0usize;
        while offset < payload.len() {
            let len = (payload.len() - offset).min(WRITE_CHUNK_MAX as usize);
            let chunk_spec = VarSpec::bytes_at(
                spec.area,
                spec.db,
                spec.start + offset as u16,
                len as u16,
            );
            self.write_single(chunk_spec, &payload[offset..offset + len])
                .await?;
            offset += len;
        }
        Ok(())
    }

    async fn write_single(&mut self, spec: VarSpec, payload: &[u8]) -> Result<(), S7Error> {
        let mut last = None;
        for attempt in 1..=CHUNK_RETRIES {
            match self.write_once(spec, payload).await {
                Ok(()) => return Ok(()),
                Err(e @ (S7Error::ConnectionLost(_) | S7Error::Cancelled)) => {
                    return Err(e);
                },
                Err(e) => {
                    warn!("write chunk attempt {attempt}/{CHUNK_RETRIES} failed: {e}");
                    last = Some(e);
                },
            }
            if self.transport.is_none() {
                break;
            }
        }
        Err(last.unwrap_or(S7Error::WriteData))
    }

    async fn write_once(&mut self, spec: VarSpec, payload: &[u8]) -> Result<(), S7Error> {
        let frame = build_write_var(self.next_ref(), &[(spec, payload)])?;
        let resp = self.round_trip(&frame).await?;
        let codes = parse_write_var_response(&resp)?;
        if codes.first() == Some(&crate::frames::var::RET_OK) {
            Ok(())
        } else {
            Err(S7Error::WriteData)
        }
    }

    /// Run the whole SZL continuation sequence and return the accumulated
    /// record bytes.
    async fn exec_szl(&mut self, id: u16, index: u16) -> Result<Vec<u8>, S7Error> {
        let frame = szl::build_szl_first(self.next_ref(), id, index)?;
        let resp = self.round_trip(&frame).await?;
        let mut chunk = szl::parse_szl_response(&resp, true)?;

        let mut data = Vec::new();
        let mut length_read = chunk.data.len();
        data.extend_from_slice(&chunk.data);

        let mut rounds = 0;
        while chunk.more_follows {
            rounds += 1;
            if rounds > SZL_CHUNK_LIMIT {
                return Err(S7Error::MalformedFrame(
                    "SZL continuation sequence does not terminate".to_string(),
                ));
            }
            let frame = szl::build_szl_next(self.next_ref(), chunk.seq)?;
            let resp = self.round_trip(&frame).await?;
            chunk = szl::parse_szl_response(&resp, false)?;
            length_read += chunk.data.len();
            data.extend_from_slice(&chunk.data);
        }
        debug!("SZL 0x{id:04x}.{index}: {length_read} bytes over {} frames", rounds + 1);
        Ok(data)
    }

    /// One exchange against the owned socket, with metrics recording.
    async fn round_trip(&mut self, frame: &[u8]) -> Result<BytesMut, S7Error> {
        let transport = self.transport.as_mut().ok_or_else(|| {
            S7Error::ConnectionLost("no socket".to_string())
        })?;
        match transport.exchange(frame, &self.cancel).await {
            Ok((resp, send_took, recv_took)) => {
                self.metrics.record_sent(frame.len(), send_took);
                self.metrics.record_received(resp.len(), recv_took);
                Ok(resp)
            },
            Err(e) => {
                if e.is_transport() && !matches!(e, S7Error::Cancelled) {
                    self.lose_transport("socket exchange failed");
                }
                Err(e)
            },
        }
    }

    fn lose_transport(&mut self, why: &str) {
        if self.transport.take().is_some() {
            warn!("dropping session socket: {why}");
        }
        self.session.set_phase(Phase::Disconnected);
        self.events.set_phase(Phase::Disconnected);
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1).max(1);
        self.pdu_ref
    }

    async fn open_socket(&mut self, pdu_hint: u16) -> Result<(), S7Error> {
        self.transport = None;
        let transport = PlcTransport::connect(
            self.ip,
            self.port,
            self.socket_timeout,
            pdu_hint,
            &self.cancel,
        )
        .await?;
        self.transport = Some(transport);
        Ok(())
    }

    async fn iso_handshake(&mut self, profile: TsapProfile) -> Result<(), S7Error> {
        let frame = cotp::build_connection_request(profile, self.rack, self.slot);
        let resp = self.round_trip(&frame).await?;
        cotp::parse_connection_confirm(&resp)
    }

    async fn comm_setup(&mut self, requested_pdu: u16) -> Result<u16, S7Error> {
        let frame = setup::build_comm_setup(self.next_ref(), requested_pdu)?;
        let resp = self.round_trip(&frame).await?;
        let announced = setup::parse_comm_setup_response(&resp)?;
        let negotiated = setup::negotiated_pdu(requested_pdu, announced);
        self.session.set_negotiated_pdu(negotiated);
        Ok(negotiated)
    }
}

/// Offset-contiguous chunk plan for a read of `count` bytes at `start`:
/// every chunk is at most `pdu_len - 32` bytes.
pub fn read_chunk_plan(start: u16, count: u16, pdu_len: u16) -> Vec<(u16, u16)> {
    let max_chunk = pdu_len.saturating_sub(READ_OVERHEAD).max(1);
    let mut chunks = Vec::new();
    let mut at = 0u16;
    while at < count {
        let len = (count - at).min(max_chunk);
        chunks.push((start + at, len));
        at += len;
    }
    chunks
}
