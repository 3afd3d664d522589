// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Renderfarm node
//!
//! The `renderfarm` binary runs either side of a farm:
//!
//! - `renderfarm manager` - splits tasks across the agent pool and merges results
//! - `renderfarm agent` - runs the renderer for work pushed by a manager
//! - `renderfarm config show|validate|generate` - configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use renderfarm::commands::{self, ConfigCommand};
use renderfarm::daemon;
use renderfarm::logging::init_logging;
use renderfarm_core::domain::node_config::{NodeConfigManifest, NodeRole};
use renderfarm_core::infrastructure::log_buffer::LogBuffer;

/// Render farm manager and agent daemons
#[derive(Parser)]
#[command(name = "renderfarm")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "RENDERFARM_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to the configured level
    #[arg(long, global = true, env = "RENDERFARM_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a manager node
    #[command(name = "manager")]
    Manager,

    /// Run an agent node
    #[command(name = "agent")]
    Agent,

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Manager => run_node(cli.config, cli.log_level, NodeRole::Manager).await,
        Commands::Agent => run_node(cli.config, cli.log_level, NodeRole::Agent).await,
        Commands::Config { command } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), None)?;
            commands::config::handle_command(command, cli.config).await
        }
    }
}

async fn run_node(config: Option<PathBuf>, log_level: Option<String>, role: NodeRole) -> Result<()> {
    // Logging needs the buffer size, so the config is read before any subscriber exists
    let config = NodeConfigManifest::load_or_default(config).context("Failed to load configuration")?;
    let logs = LogBuffer::new(config.spec.logging.log_buffer_lines);
    let level = log_level.unwrap_or_else(|| config.spec.logging.level.clone());
    init_logging(&level, Some(logs.clone()))?;

    info!(role = ?role, node = %config.metadata.name, "Starting renderfarm node");
    daemon::start_node(config, role, logs).await
}
