// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Tracing bootstrap driven by a small YAML config.
//!
//! Returns the non-blocking writer guard when logging to a file; the caller
//! keeps it alive for the lifetime of the process. Initialization is
//! idempotent: later calls are no-ops.

use std::fs;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

static INIT: OnceCell<()> = OnceCell::new();

#[derive(Debug, Deserialize, Clone)]
struct LoggerConfig {
    logger: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
enum Output {
    Stdout,
    Stderr,
    File,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
enum RotationFreq {
    Minutely,
    Hourly,
    Daily,
    Never,
}

#[derive(Debug, Deserialize, Clone)]
struct LogFileConfig {
    path: String,
    #[serde(default)]
    rotation_frequency: Option<RotationFreq>,
}

#[derive(Debug, Deserialize, Clone)]
struct LogConfig {
    level: String,
    output: Output,
    #[serde(default)]
    json: bool,
    #[serde(default)]
    is_show_line: bool,
    #[serde(default)]
    is_show_target: bool,
    file: Option<LogFileConfig>,
}

/// Install the global subscriber from the YAML at `path`.
pub fn init_logger(path: &str) -> Result<Option<WorkerGuard>> {
    if INIT.get().is_some() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read logger config {path:?}"))?;
    let cfg: LoggerConfig =
        serde_yaml::from_str(&raw).context("failed to parse logger config YAML")?;
    let log = cfg.logger;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .context("invalid log level")?;

    let (writer, guard): (BoxMakeWriter, Option<WorkerGuard>) = match log.output {
        Output::Stdout => (BoxMakeWriter::new(std::io::stdout), None),
        Output::Stderr => (BoxMakeWriter::new(std::io::stderr), None),
        Output::File => {
            let file = log
                .file
                .as_ref()
                .context("output=file requires a file section")?;
            let rotation = match file.rotation_frequency {
                Some(RotationFreq::Minutely) => Rotation::MINUTELY,
                Some(RotationFreq::Hourly) => Rotation::HOURLY,
                Some(RotationFreq::Daily) => Rotation::DAILY,
                Some(RotationFreq::Never) | None => Rotation::NEVER,
            };
            let (dir, prefix) = match file.path.rsplit_once('/') {
                Some((d, p)) => (d.to_string(), p.to_string()),
                None => (".".to_string(), file.path.clone()),
            };
            let appender = RollingFileAppender::new(rotation, dir, prefix);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        },
    };

    if log.json {
        let layer = fmt::layer()
            .json()
            .with_writer(writer)
            .with_line_number(log.is_show_line)
            .with_target(log.is_show_target);
        Registry::default().with(filter).with(layer).try_init()?;
    } else {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_line_number(log.is_show_line)
            .with_target(log.is_show_target);
        Registry::default().with(filter).with(layer).try_init()?;
    }

    let _ = INIT.set(());
    Ok(guard)
}
