// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The watchdog writer: a periodic sentinel write to a DBW address while
//! the session is Ready. Failures are logged and never touch the
//! connection state machine.

use std::{str::FromStr, sync::Arc, time::Duration};

use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    addr::TagAddress,
    cfg::config::WatchdogConfig,
    client::{dispatcher::DispatcherHandle, session::SessionState},
    error::S7Error,
    frames::var::VarSpec,
};

pub struct Watchdog {
    address: TagAddress,
    value: u16,
    interval: Duration,
    dispatcher: DispatcherHandle,
    session: Arc<SessionState>,
    cancel: CancellationToken,
}

impl Watchdog {
    pub fn from_config(
        cfg: &WatchdogConfig,
        dispatcher: DispatcherHandle,
        session: Arc<SessionState>,
        cancel: CancellationToken,
    ) -> Result<Self, S7Error> {
        let address = TagAddress::from_str(&cfg.address)?;
        Ok(Watchdog {
            address,
            value: cfg.value,
            interval: cfg.interval,
            dispatcher,
            session,
            cancel,
        })
    }

    pub fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let spec = VarSpec::bytes_at(
            self.address.area,
            self.address.db,
            self.address.byte,
            2,
        );
        let payload = self.value.to_be_bytes().to_vec();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {},
            }
            if !self.session.is_ready() {
                continue;
            }
            match self.dispatcher.write(spec, payload.clone()).await {
                Ok(()) => debug!("watchdog wrote {} to {}", self.value, self.address),
                Err(e) => warn!("watchdog write to {} failed: {e}", self.address),
            }
        }
    }
}
