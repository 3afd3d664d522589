// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;

use renderfarm_core::domain::node_config::{NodeConfigManifest, NodeRole, StaticAgentConfig};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path
        #[arg(short, long, default_value = "./renderfarm-config.yaml")]
        output: PathBuf,

        /// Role the generated node runs as
        #[arg(long, value_enum, default_value_t = RoleArg::Manager)]
        role: RoleArg,

        /// Include a sample static agent
        #[arg(long)]
        examples: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum RoleArg {
    Manager,
    Agent,
}

impl From<RoleArg> for NodeRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Manager => NodeRole::Manager,
            RoleArg::Agent => NodeRole::Agent,
        }
    }
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate {
            output,
            role,
            examples,
        } => generate(output, role.into(), examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = NodeConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. RENDERFARM_CONFIG_PATH: {}",
            std::env::var("RENDERFARM_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./renderfarm-config.yaml");
        println!("  4. ~/.renderfarm/config.yaml");
        println!("  5. /etc/renderfarm/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Node:".bold());
    println!("  Name: {}", config.metadata.name);
    println!("  Role: {:?}", spec.node.role);
    println!(
        "  Listen: {}:{}",
        spec.network.bind_address, spec.network.port
    );
    println!("  User: {}", spec.auth.user);
    println!(
        "  Password: {}",
        if spec.auth.password.is_some() {
            "(set)".normal()
        } else {
            "(not set)".yellow()
        }
    );
    println!();

    println!("{}", "Storage:".bold());
    println!("  Session: {}", config.session_dir().display());
    println!("  Cache: {}", config.cache_dir().display());
    match spec.storage.cache_limit_mb {
        Some(mb) => println!("  Cache limit: {} MB", mb),
        None => println!("  Cache limit: {}", "(free disk space)".dimmed()),
    }
    println!();

    match spec.node.role {
        NodeRole::Agent => {
            println!("{}", "Renderer:".bold());
            println!("  Executable: {}", spec.agent.renderer);
            if !spec.agent.renderer_args.is_empty() {
                println!("  Arguments: {}", spec.agent.renderer_args.join(" "));
            }
            println!("  Stop grace: {}s", spec.agent.stop_grace_seconds);
        }
        NodeRole::Manager => {
            println!("{}", "Agent pool:".bold());
            println!("  Merger: {}", spec.pool.merger);
            println!("  Idle timeout: {}s", spec.pool.idle_timeout_seconds);
            println!("  Upload concurrency: {}", spec.pool.upload_concurrency);
            if spec.pool.agents.is_empty() {
                println!("  Agents: {}", "(none configured)".dimmed());
            }
            for agent in &spec.pool.agents {
                println!("  - {} → {}", agent.name.bold(), agent.address);
            }
        }
    }
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = NodeConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, role: NodeRole, with_examples: bool) -> Result<()> {
    let config = sample_config(role, with_examples);
    config
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );
    if config.spec.auth.password.is_none() {
        println!(
            "{}",
            "  Set spec.auth.password or RENDERFARM_PASSWORD before starting the node".yellow()
        );
    }

    Ok(())
}

fn sample_config(role: NodeRole, with_examples: bool) -> NodeConfigManifest {
    let mut config = NodeConfigManifest::default();
    config.spec.node.role = role;
    if with_examples {
        config.spec.auth.password = Some("env:RENDERFARM_PASSWORD".to_string());
        if role == NodeRole::Manager {
            config.spec.pool.agents.push(StaticAgentConfig {
                name: "workstation-1".to_string(),
                address: "192.168.1.20:8443".to_string(),
            });
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_generated_config_is_valid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("renderfarm-config.yaml");
        generate(path.clone(), NodeRole::Manager, true).await.unwrap();

        let loaded = NodeConfigManifest::from_yaml_file(&path).unwrap();
        loaded.validate().unwrap();
        assert_eq!(loaded.spec.node.role, NodeRole::Manager);
        assert_eq!(loaded.spec.pool.agents.len(), 1);
        assert_eq!(
            loaded.spec.auth.password.as_deref(),
            Some("env:RENDERFARM_PASSWORD")
        );
    }

    #[test]
    fn test_agent_sample_has_no_pool() {
        let config = sample_config(NodeRole::Agent, true);
        assert_eq!(config.spec.node.role, NodeRole::Agent);
        assert!(config.spec.pool.agents.is_empty());
    }
}
