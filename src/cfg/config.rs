// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, net::Ipv4Addr, path::Path, str::FromStr, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    addr::{Area, TagAddress, Width},
    cfg::enums::CpuType,
};

/// Full client configuration: the closed set of recognised options plus
/// runtime knobs that never reach the wire.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Target PLC identity: family, address and chassis position.
    pub plc: PlcConfig,
    /// Tag polling cadence.
    #[serde(default)]
    pub polling: PollingConfig,
    /// Optional periodic sentinel write.
    #[serde(default)]
    pub watchdog: Option<WatchdogConfig>,
    /// Timeouts that live outside the S7 protocol.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Identity of the target CPU.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PlcConfig {
    #[serde(rename = "CpuType")]
    /// CPU family; selects TSAP profiles and the optimal PDU length.
    pub cpu_type: CpuType,

    #[serde(rename = "Ip")]
    /// Target IPv4 address; the port is always 102.
    pub ip: Ipv4Addr,

    #[serde(skip, default = "default_port")]
    /// ISO-TSAP port. Not a config-file option; overridable in code for
    /// embedded test servers.
    pub port: u16,

    #[serde(rename = "Rack")]
    /// Chassis rack, encoded into the destination TSAP low byte.
    pub rack: u8,

    #[serde(rename = "Slot")]
    /// CPU slot, encoded into the destination TSAP low byte.
    pub slot: u8,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PollingConfig {
    #[serde(rename = "PollIntervalMs", with = "serde_millis")]
    /// Scan cadence of the polling engine.
    pub interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            interval: Duration::from_millis(100),
        }
    }
}

/// Periodic write of a sentinel value to a DBW address while the session is
/// Ready.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct WatchdogConfig {
    #[serde(rename = "Address")]
    /// DBW-typed address, e.g. `DB64.DBW0`.
    pub address: String,

    #[serde(rename = "Value", default = "default_watchdog_value")]
    pub value: u16,

    #[serde(
        rename = "IntervalS",
        with = "serde_secs",
        default = "default_watchdog_interval"
    )]
    pub interval: Duration,
}

fn default_port() -> u16 {
    crate::client::transport::ISO_TCP_PORT
}

fn default_watchdog_value() -> u16 {
    4500
}

fn default_watchdog_interval() -> Duration {
    Duration::from_secs(10)
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    #[serde(
        rename = "SocketTimeoutS",
        with = "serde_secs",
        default = "default_socket_timeout"
    )]
    /// Per-socket-operation deadline.
    pub socket_timeout: Duration,

    #[serde(
        rename = "TicketDeadlineS",
        with = "serde_secs",
        default = "default_ticket_deadline"
    )]
    /// Default per-request deadline inherited by tickets.
    pub ticket_deadline: Duration,

    #[serde(
        rename = "ProbeTimeoutS",
        with = "serde_secs",
        default = "default_probe_timeout"
    )]
    /// Reachability probe deadline.
    pub probe_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            socket_timeout: default_socket_timeout(),
            ticket_deadline: default_ticket_deadline(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

fn default_socket_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_ticket_deadline() -> Duration {
    Duration::from_secs(5)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(2)
}

impl Config {
    /// Programmatic construction with all optional sections defaulted.
    pub fn new(cpu_type: CpuType, ip: Ipv4Addr, rack: u8, slot: u8) -> Self {
        Config {
            plc: PlcConfig {
                cpu_type,
                ip,
                port: default_port(),
                rack,
                slot,
            },
            polling: PollingConfig::default(),
            watchdog: None,
            runtime: RuntimeConfig::default(),
        }
    }

    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates invariants the rest of the crate relies on.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.plc.rack <= 7, "Rack must be <= 7");
        ensure!(self.plc.slot <= 31, "Slot must be <= 31");
        ensure!(
            self.polling.interval >= Duration::from_millis(10),
            "PollIntervalMs must be >= 10"
        );
        ensure!(
            self.runtime.socket_timeout >= Duration::from_millis(100),
            "SocketTimeoutS too small"
        );
        ensure!(
            self.runtime.ticket_deadline >= Duration::from_millis(100),
            "TicketDeadlineS too small"
        );

        if let Some(wd) = &self.watchdog {
            ensure!(
                wd.interval >= Duration::from_secs(1),
                "watchdog IntervalS must be >= 1"
            );
            let addr = TagAddress::from_str(&wd.address)
                .map_err(|e| anyhow::anyhow!("watchdog Address: {e}"))?;
            ensure!(
                addr.area == Area::DataBlock && addr.width == Width::Word,
                "watchdog Address must be a DBW address"
            );
        }
        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helpers for representing `Duration` as a number of milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
