// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection bring-up: Probe → TcpConnect → IsoHandshake → CommSetup.
//!
//! The context walks the TSAP profile sequence of the configured CPU family;
//! a profile that fails either the ISO handshake or CommSetup is abandoned
//! and the next one is tried on a fresh socket. The machine only asks the
//! dispatcher for socket work — it never touches the stream itself.

use std::{net::Ipv4Addr, pin::Pin, time::Duration};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::enums::CpuType,
    client::{
        dispatcher::DispatcherHandle,
        session::{Phase, Reachability, SessionState},
        transport::probe_reachable,
    },
    error::S7Error,
    events::EventHub,
    frames::cotp::TsapProfile,
    state_machine::common::{StateMachine, StateMachineCtx, Transition},
};

/// Context of one bring-up attempt.
pub struct ConnectCtx {
    pub dispatcher: DispatcherHandle,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub cpu_type: CpuType,
    pub probe_timeout: Duration,
    pub session: Arc<SessionState>,
    pub events: Arc<EventHub>,

    profiles: &'static [TsapProfile],
    profile_idx: usize,
    state: Option<ConnectStates>,
}

impl ConnectCtx {
    pub fn new(
        dispatcher: DispatcherHandle,
        ip: Ipv4Addr,
        port: u16,
        cpu_type: CpuType,
        probe_timeout: Duration,
        session: Arc<SessionState>,
        events: Arc<EventHub>,
    ) -> Self {
        ConnectCtx {
            dispatcher,
            ip,
            port,
            cpu_type,
            probe_timeout,
            session,
            events,
            profiles: cpu_type.profile_sequence(),
            profile_idx: 0,
            state: Some(ConnectStates::Probe(Probe)),
        }
    }

    fn set_phase(&self, phase: Phase) {
        self.session.set_phase(phase);
        self.events.set_phase(phase);
    }

    fn current_profile(&self) -> TsapProfile {
        self.profiles[self.profile_idx.min(self.profiles.len() - 1)]
    }

    /// Move to the next TSAP profile. True while one is left to try.
    fn advance_profile(&mut self) -> bool {
        self.profile_idx += 1;
        self.profile_idx < self.profiles.len()
    }

    async fn probe(&mut self) -> Result<(), S7Error> {
        if probe_reachable(self.ip, self.port, self.probe_timeout).await {
            self.session.set_reachable(Reachability::Yes);
            Ok(())
        } else {
            self.session.set_reachable(Reachability::No);
            Err(S7Error::ConnectionLost(format!(
                "{}:{} is not reachable",
                self.ip, self.port
            )))
        }
    }

    async fn open_socket(&mut self) -> Result<(), S7Error> {
        self.set_phase(Phase::TcpConnecting);
        self.dispatcher
            .open_socket(self.cpu_type.optimal_pdu_length())
            .await
    }

    async fn iso_handshake(&mut self) -> Result<(), S7Error> {
        self.set_phase(Phase::IsoHandshake);
        let profile = self.current_profile();
        debug!("ISO handshake with profile {profile}");
        self.dispatcher.iso_handshake(profile).await
    }

    async fn comm_setup(&mut self) -> Result<u16, S7Error> {
        self.set_phase(Phase::CommSetup);
        let requested = self.cpu_type.optimal_pdu_length();
        let negotiated = self.dispatcher.comm_setup(requested).await?;
        info!(
            "session ready: profile {}, PDU {negotiated} (requested {requested})",
            self.current_profile()
        );
        Ok(negotiated)
    }
}

/// Reachability gate before any socket work.
#[derive(Debug)]
pub struct Probe;

/// Fresh TCP socket through the dispatcher.
#[derive(Debug)]
pub struct Tcp;

/// COTP Connection Request / Confirm with the current profile.
#[derive(Debug)]
pub struct Iso;

/// PDU-size negotiation; completing it makes the profile stick.
#[derive(Debug)]
pub struct Setup;

#[derive(Debug)]
pub enum ConnectStates {
    Probe(Probe),
    Tcp(Tcp),
    Iso(Iso),
    Setup(Setup),
}

type ConnectStepOut = Transition<ConnectStates, Result<(), S7Error>>;

impl StateMachine<ConnectCtx, ConnectStepOut> for Probe {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = ConnectStepOut> + Send + 'a>>
    where
        Self: 'a;

    fn step<'a>(&'a self, ctx: &'a mut ConnectCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            match ctx.probe().await {
                Ok(()) => Transition::Next(ConnectStates::Tcp(Tcp), Ok(())),
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

impl StateMachine<ConnectCtx, ConnectStepOut> for Tcp {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = ConnectStepOut> + Send + 'a>>
    where
        Self: 'a;

    fn step<'a>(&'a self, ctx: &'a mut ConnectCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            match ctx.open_socket().await {
                Ok(()) => Transition::Next(ConnectStates::Iso(Iso), Ok(())),
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

impl StateMachine<ConnectCtx, ConnectStepOut> for Iso {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = ConnectStepOut> + Send + 'a>>
    where
        Self: 'a;

    fn step<'a>(&'a self, ctx: &'a mut ConnectCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            match ctx.iso_handshake().await {
                Ok(()) => Transition::Next(ConnectStates::Setup(Setup), Ok(())),
                Err(e) => {
                    warn!("profile {} failed the ISO handshake: {e}", ctx.current_profile());
                    if ctx.advance_profile() {
                        // Fresh socket for the next profile.
                        Transition::Next(ConnectStates::Tcp(Tcp), Ok(()))
                    } else {
                        Transition::Done(Err(e))
                    }
                },
            }
        })
    }
}

impl StateMachine<ConnectCtx, ConnectStepOut> for Setup {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = ConnectStepOut> + Send + 'a>>
    where
        Self: 'a;

    fn step<'a>(&'a self, ctx: &'a mut ConnectCtx) -> Self::StepResult<'a> {
        Box::pin(async move {
            match ctx.comm_setup().await {
                Ok(_negotiated) => {
                    ctx.session.set_active_profile(Some(ctx.current_profile()));
                    ctx.set_phase(Phase::Ready);
                    Transition::Done(Ok(()))
                },
                Err(e) => {
                    warn!("profile {} failed CommSetup: {e}", ctx.current_profile());
                    if ctx.advance_profile() {
                        Transition::Next(ConnectStates::Tcp(Tcp), Ok(()))
                    } else {
                        Transition::Done(Err(e))
                    }
                },
            }
        })
    }
}

impl StateMachineCtx<Result<(), S7Error>> for ConnectCtx {
    async fn execute(&mut self, cancel: &CancellationToken) -> Result<(), S7Error> {
        debug!("connection bring-up for {} ({})", self.ip, self.cpu_type);
        loop {
            if cancel.is_cancelled() {
                return Err(S7Error::Cancelled);
            }
            let state = self.state.take().ok_or_else(|| {
                S7Error::ConnectionLost("connect state machine exhausted".to_string())
            })?;
            let trans = match state {
                ConnectStates::Probe(s) => s.step(self).await,
                ConnectStates::Tcp(s) => s.step(self).await,
                ConnectStates::Iso(s) => s.step(self).await,
                ConnectStates::Setup(s) => s.step(self).await,
            };

            match trans {
                Transition::Next(next, r) => {
                    r?;
                    self.state = Some(next);
                },
                Transition::Stay(Ok(())) => {},
                Transition::Stay(Err(e)) => return Err(e),
                Transition::Done(r) => return r,
            }
        }
    }
}
