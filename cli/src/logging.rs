// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Tracing subscriber setup

use anyhow::{Context, Result};
use renderfarm_core::infrastructure::log_buffer::LogBuffer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber
///
/// `RUST_LOG` wins over `level`. When `buffer` is given every event is
/// also captured there, without ANSI colours, for `GET log`.
pub fn init_logging(level: &str, buffer: Option<LogBuffer>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let captured = buffer.map(|buffer| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(buffer)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(captured)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}
