// Benji backup system.

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.

//! Logging setup for the CLI.
//!
//! Human-readable log lines go to stderr so machine-readable output on
//! stdout stays clean; an optional file layer mirrors everything to the
//! configured log file.

use std::path::Path;

use tracing::metadata::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, Registry};

pub struct LogGuard {
    _worker_guard: Option<WorkerGuard>,
}

pub fn init(level: tracing::Level, log_file: Option<&Path>) -> Result<LogGuard, String> {
    let mut worker_guard = None;

    let stderr_layer = fmt::Layer::default()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(LevelFilter::from(level));

    let file_layer = if let Some(path) = log_file {
        let directory = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .ok_or("cannot determine log file name")?
            .to_string_lossy()
            .to_string();
        let writer = tracing_appender::rolling::never(directory, file_name);
        let (writer, guard) = tracing_appender::non_blocking(writer);
        worker_guard = Some(guard);
        Some(
            fmt::Layer::default()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer)
                .with_filter(LevelFilter::from(level)),
        )
    } else {
        None
    };

    Registry::default()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| "failed to install the global logger".to_string())?;

    Ok(LogGuard {
        _worker_guard: worker_guard,
    })
}
