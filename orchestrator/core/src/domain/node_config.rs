// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Node Configuration Types
//
// Defines the configuration schema for renderfarm nodes, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Node role (manager or agent)
// - Network, credentials and storage layout
// - Renderer invocation and agent pool policy
// - Logging

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "renderfarm/v1";

/// Top-level Kubernetes-style node configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigManifest {
    /// API version (must be "renderfarm/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "NodeConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: NodeConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Node name; also the TLS identity of this node
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfigSpec {
    #[serde(default)]
    pub node: NodeIdentity,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeIdentity {
    #[serde(default)]
    pub role: NodeRole,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Manager,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network bind address (e.g. "0.0.0.0" or "127.0.0.1")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// HTTPS API port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Extra DNS names / IPs placed in this node's certificate
    #[serde(default)]
    pub subject_alt_names: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
            subject_alt_names: Vec::new(),
        }
    }
}

/// Single Basic Auth credential shared by the manager and its agents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_user")]
    pub user: String,

    /// Supports "env:VAR_NAME"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            user: default_user(),
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Task snapshots, agent registrations and TLS material
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,

    /// Blob cache root; defaults to `<session_dir>/cache`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    /// Upper bound on cached bytes, in megabytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_limit_mb: Option<u64>,

    #[serde(default = "default_flush_interval")]
    pub metadata_flush_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            session_dir: default_session_dir(),
            cache_dir: None,
            cache_limit_mb: None,
            metadata_flush_seconds: default_flush_interval(),
        }
    }
}

/// Renderer invocation on agent nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_renderer")]
    pub renderer: String,

    #[serde(default)]
    pub renderer_args: Vec<String>,

    /// Grace period between interrupt and kill when a render is stopped
    #[serde(default = "default_stop_grace")]
    pub stop_grace_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            renderer: default_renderer(),
            renderer_args: Vec::new(),
            stop_grace_seconds: default_stop_grace(),
        }
    }
}

/// Manager-side agent pool policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Idle agents are stopped after this many seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,

    /// Concurrent file uploads per agent
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,

    #[serde(default = "default_upload_retries")]
    pub upload_retries: u32,

    /// Agent instance/state poll interval
    #[serde(default = "default_state_poll")]
    pub state_poll_seconds: u64,

    /// Work loop and execution watcher tick
    #[serde(default = "default_work_poll")]
    pub work_poll_seconds: u64,

    /// Executable combining partial results: `<merger> <out> <in...>`
    #[serde(default = "default_merger")]
    pub merger: String,

    /// Port agents listen on when addressed by host only
    #[serde(default = "default_api_port")]
    pub agent_port: u16,

    /// Statically configured agents (local pool)
    #[serde(default)]
    pub agents: Vec<StaticAgentConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: default_idle_timeout(),
            upload_concurrency: default_upload_concurrency(),
            upload_retries: default_upload_retries(),
            state_poll_seconds: default_state_poll(),
            work_poll_seconds: default_work_poll(),
            merger: default_merger(),
            agent_port: default_api_port(),
            agents: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticAgentConfig {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Capacity of the in-memory log served at `GET log`
    #[serde(default = "default_log_buffer_lines")]
    pub log_buffer_lines: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_buffer_lines: default_log_buffer_lines(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8443
}

fn default_user() -> String {
    "renderfarm".to_string()
}

fn default_session_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("renderfarm"))
        .unwrap_or_else(|| PathBuf::from(".renderfarm"))
}

fn default_flush_interval() -> u64 {
    10
}

fn default_renderer() -> String {
    "renderfarm-render".to_string()
}

fn default_stop_grace() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_upload_concurrency() -> usize {
    4
}

fn default_upload_retries() -> u32 {
    5
}

fn default_state_poll() -> u64 {
    5
}

fn default_work_poll() -> u64 {
    1
}

fn default_merger() -> String {
    "renderfarm-merge".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_buffer_lines() -> usize {
    100_000
}

impl Default for NodeConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "renderfarm-node".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: "NodeConfig".to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: NodeConfigSpec::default(),
        }
    }
}

impl NodeConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. RENDERFARM_CONFIG_PATH environment variable
    /// 2. ./renderfarm-config.yaml (working directory)
    /// 3. ~/.renderfarm/config.yaml (user home)
    /// 4. /etc/renderfarm/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("RENDERFARM_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./renderfarm-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".renderfarm").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/renderfarm/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path (fail if missing/invalid)
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(user) = std::env::var("RENDERFARM_USER") {
            tracing::info!("Environment override: RENDERFARM_USER");
            self.spec.auth.user = user;
        }

        if let Ok(password) = std::env::var("RENDERFARM_PASSWORD") {
            tracing::info!("Environment override: RENDERFARM_PASSWORD");
            self.spec.auth.password = Some(password);
        }

        if let Ok(val) = std::env::var("RENDERFARM_CACHE_LIMIT") {
            match val.trim().parse::<u64>() {
                Ok(mb) => {
                    tracing::info!("Environment override: RENDERFARM_CACHE_LIMIT={}", mb);
                    self.spec.storage.cache_limit_mb = Some(mb);
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for RENDERFARM_CACHE_LIMIT: '{}'. Expected megabytes. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != "NodeConfig" {
            anyhow::bail!("Invalid kind: '{}'. Must be 'NodeConfig'", self.kind);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.auth.user.is_empty() {
            anyhow::bail!("spec.auth.user cannot be empty");
        }

        if self.spec.auth.user.contains(':') {
            anyhow::bail!("spec.auth.user cannot contain ':'");
        }

        if self.spec.pool.upload_concurrency == 0 {
            anyhow::bail!("spec.pool.upload_concurrency must be at least 1");
        }

        if self.spec.pool.work_poll_seconds == 0 || self.spec.pool.state_poll_seconds == 0 {
            anyhow::bail!("spec.pool poll intervals must be at least 1 second");
        }

        if self.spec.logging.log_buffer_lines == 0 {
            anyhow::bail!("spec.logging.log_buffer_lines must be at least 1");
        }

        let mut seen = std::collections::HashSet::new();
        for agent in &self.spec.pool.agents {
            if agent.name.is_empty() || agent.address.is_empty() {
                anyhow::bail!("Static agents need both a name and an address");
            }
            if !seen.insert(agent.name.as_str()) {
                anyhow::bail!("Duplicate static agent name: {}", agent.name);
            }
        }

        Ok(())
    }

    /// Resolved Basic Auth credential
    pub fn credentials(&self) -> anyhow::Result<(String, String)> {
        let password = match self.spec.auth.password.as_deref() {
            Some(p) if p.starts_with("env:") => std::env::var(&p[4..])
                .map_err(|_| anyhow::anyhow!("Environment variable {} is not set", &p[4..]))?,
            Some(p) if !p.is_empty() => p.to_string(),
            _ => anyhow::bail!(
                "spec.auth.password is not configured (set it or RENDERFARM_PASSWORD)"
            ),
        };
        Ok((self.spec.auth.user.clone(), password))
    }

    pub fn session_dir(&self) -> &Path {
        &self.spec.storage.session_dir
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.spec
            .storage
            .cache_dir
            .clone()
            .unwrap_or_else(|| self.spec.storage.session_dir.join("cache"))
    }

    pub fn cache_limit_bytes(&self) -> Option<u64> {
        self.spec.storage.cache_limit_mb.map(|mb| mb * 1024 * 1024)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.spec.agent.stop_grace_seconds)
    }
}
