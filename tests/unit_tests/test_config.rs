// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, net::Ipv4Addr, time::Duration};

use s7_client_rs::cfg::{
    cli::resolve_config_path, config::Config, enums::CpuType, logger::init_logger,
};
use serial_test::serial;

#[test]
fn full_config_parses() {
    let yaml = r#"
plc:
  CpuType: S7-300
  Ip: 192.168.0.10
  Rack: 0
  Slot: 2
polling:
  PollIntervalMs: 250
watchdog:
  Address: DB64.DBW0
  Value: 4500
  IntervalS: 10
runtime:
  SocketTimeoutS: 10
  TicketDeadlineS: 5
  ProbeTimeoutS: 2
"#;
    let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
    cfg.validate().expect("valid");

    assert_eq!(cfg.plc.cpu_type, CpuType::S7_300);
    assert_eq!(cfg.plc.ip, Ipv4Addr::new(192, 168, 0, 10));
    assert_eq!(cfg.plc.port, 102);
    assert_eq!((cfg.plc.rack, cfg.plc.slot), (0, 2));
    assert_eq!(cfg.polling.interval, Duration::from_millis(250));

    let wd = cfg.watchdog.expect("watchdog section");
    assert_eq!(wd.address, "DB64.DBW0");
    assert_eq!(wd.value, 4500);
    assert_eq!(wd.interval, Duration::from_secs(10));

    assert_eq!(cfg.runtime.socket_timeout, Duration::from_secs(10));
    assert_eq!(cfg.runtime.ticket_deadline, Duration::from_secs(5));
    assert_eq!(cfg.runtime.probe_timeout, Duration::from_secs(2));
}

#[test]
fn minimal_config_gets_defaults() {
    let yaml = r#"
plc:
  CpuType: s7-1500
  Ip: 10.0.0.1
  Rack: 0
  Slot: 1
"#;
    let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
    cfg.validate().expect("valid");

    assert_eq!(cfg.plc.cpu_type, CpuType::S7_1500);
    assert_eq!(cfg.polling.interval, Duration::from_millis(100));
    assert!(cfg.watchdog.is_none());
    assert_eq!(cfg.runtime.socket_timeout, Duration::from_secs(10));
    assert_eq!(cfg.runtime.ticket_deadline, Duration::from_secs(5));
}

#[test]
fn watchdog_address_must_be_dbw() {
    let yaml = r#"
plc:
  CpuType: S7-300
  Ip: 10.0.0.1
  Rack: 0
  Slot: 2
watchdog:
  Address: MB10
"#;
    let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
    assert!(cfg.validate().is_err());
}

#[test]
fn rack_and_slot_bounds() {
    let mut cfg = Config::new(CpuType::S7_400, Ipv4Addr::LOCALHOST, 0, 1);
    cfg.validate().expect("valid");

    cfg.plc.rack = 8;
    assert!(cfg.validate().is_err());

    cfg.plc.rack = 7;
    cfg.plc.slot = 32;
    assert!(cfg.validate().is_err());
}

#[test]
fn config_path_resolution() {
    let dir = std::env::temp_dir().join("s7-client-rs-cfg-test");
    fs::create_dir_all(&dir).expect("temp dir");
    let path = dir.join("config.yaml");
    fs::write(&path, "plc:\n").expect("write");

    let resolved =
        resolve_config_path(path.to_str().expect("utf-8 path")).expect("resolve");
    assert!(resolved.is_absolute());
    assert!(resolve_config_path("does/not/exist.yaml").is_err());
}

#[test]
#[serial]
fn logger_bootstrap_is_idempotent() {
    let dir = std::env::temp_dir().join("s7-client-rs-logger-test");
    fs::create_dir_all(&dir).expect("temp dir");
    let path = dir.join("logger.yaml");
    fs::write(
        &path,
        "logger:\n  level: debug\n  output: stderr\n",
    )
    .expect("write");

    let path = path.to_str().expect("utf-8 path").to_string();
    let _guard = init_logger(&path).expect("first init");
    // Later calls are no-ops.
    assert!(init_logger(&path).expect("second init").is_none());
    tracing::debug!("logger bootstrap exercised");
}

#[test]
fn cpu_type_tables() {
    assert_eq!(CpuType::Logo0BA8.optimal_pdu_length(), 240);
    assert_eq!(CpuType::S7_200.optimal_pdu_length(), 480);
    assert_eq!(CpuType::S7_300.optimal_pdu_length(), 480);
    assert_eq!(CpuType::S7_400.optimal_pdu_length(), 960);
    assert_eq!(CpuType::S7_1200.optimal_pdu_length(), 960);
    assert_eq!(CpuType::S7_1500.optimal_pdu_length(), 1440);

    // Rack-addressed families walk PG, OP, PG_Alt; the fixed-TSAP devices
    // have a single profile.
    assert_eq!(CpuType::S7_300.profile_sequence().len(), 3);
    assert_eq!(CpuType::S7_200.profile_sequence().len(), 1);
    assert_eq!(CpuType::Logo0BA8.profile_sequence().len(), 1);
}
