// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Resource Provider
//!
//! Abstract capability that backs agents with compute instances. One
//! implementation is selected at process start and injected into the agent
//! pool; the core never provisions anything itself.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Instance lifecycle and preemption notice

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstancePower {
    /// No backing instance exists
    Missing,
    Stopped,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub power: InstancePower,
    /// Reachable `host:port` of the agent REST endpoint, when known
    pub address: Option<String>,
}

impl InstanceInfo {
    pub fn missing() -> Self {
        Self {
            power: InstancePower::Missing,
            address: None,
        }
    }
}

/// A file uploaded to the provider's bucket before instance creation
#[derive(Debug, Clone)]
pub struct BootstrapFile {
    pub name: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Operation not supported by provider {provider}: {operation}")]
    Unsupported {
        provider: String,
        operation: &'static str,
    },

    #[error("Provider request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait ResourceProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn describe_agent_instance(&self, agent: &str) -> Result<InstanceInfo, ProviderError>;

    /// Power on an existing, stopped instance
    async fn start_agent_instance(&self, agent: &str) -> Result<(), ProviderError>;

    /// Create a new instance; bootstrap files are uploaded beforehand
    async fn create_agent_instance(&self, agent: &str) -> Result<(), ProviderError>;

    async fn stop_agent_instance(&self, agent: &str) -> Result<(), ProviderError>;

    async fn delete_agent_instance(&self, agent: &str) -> Result<(), ProviderError>;

    async fn upload_bootstrap_file(
        &self,
        agent: &str,
        file: BootstrapFile,
    ) -> Result<(), ProviderError>;

    async fn is_preemption_imminent(&self, _agent: &str) -> bool {
        false
    }

    /// Seconds left before the provider forcibly terminates the instance
    async fn seconds_until_termination(&self, _agent: &str) -> Option<u64> {
        None
    }
}
