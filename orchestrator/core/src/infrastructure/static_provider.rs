// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Local pool provider
//!
//! Agents on machines the farm does not provision: workstations, spare
//! servers. The only lever is the address table; an agent counts as
//! powered on when its port accepts connections.

use crate::domain::provider::{
    BootstrapFile, InstanceInfo, InstancePower, ProviderError, ResourceProvider,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct StaticResourceProvider {
    agents: RwLock<BTreeMap<String, String>>,
    default_port: u16,
}

impl StaticResourceProvider {
    pub fn new(default_port: u16) -> Self {
        Self {
            agents: RwLock::new(BTreeMap::new()),
            default_port,
        }
    }

    /// Add or re-address an agent; a bare host gets the default port
    pub fn register(&self, name: &str, address: &str) -> String {
        let address = if address.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
            address.to_string()
        } else {
            format!("{}:{}", address, self.default_port)
        };
        self.agents.write().insert(name.to_string(), address.clone());
        address
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.agents.write().remove(name).is_some()
    }

    pub fn address(&self, name: &str) -> Option<String> {
        self.agents.read().get(name).cloned()
    }

    fn unsupported(&self, operation: &'static str) -> ProviderError {
        ProviderError::Unsupported {
            provider: self.name().to_string(),
            operation,
        }
    }
}

#[async_trait]
impl ResourceProvider for StaticResourceProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn describe_agent_instance(&self, agent: &str) -> Result<InstanceInfo, ProviderError> {
        let address = self
            .address(agent)
            .ok_or_else(|| ProviderError::UnknownAgent(agent.to_string()))?;
        let reachable = matches!(
            tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await,
            Ok(Ok(_))
        );
        debug!(agent, address = %address, reachable, "Probed local agent");
        Ok(InstanceInfo {
            power: if reachable {
                InstancePower::Running
            } else {
                InstancePower::Stopped
            },
            address: Some(address),
        })
    }

    async fn start_agent_instance(&self, _agent: &str) -> Result<(), ProviderError> {
        Err(self.unsupported("start"))
    }

    async fn create_agent_instance(&self, _agent: &str) -> Result<(), ProviderError> {
        Err(self.unsupported("create"))
    }

    async fn stop_agent_instance(&self, _agent: &str) -> Result<(), ProviderError> {
        Err(self.unsupported("stop"))
    }

    async fn delete_agent_instance(&self, _agent: &str) -> Result<(), ProviderError> {
        Err(self.unsupported("delete"))
    }

    async fn upload_bootstrap_file(
        &self,
        _agent: &str,
        _file: BootstrapFile,
    ) -> Result<(), ProviderError> {
        Err(self.unsupported("upload_bootstrap_file"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_reachability_decides_power() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().to_string();
        let provider = StaticResourceProvider::new(8443);
        provider.register("up", &open);

        let info = provider.describe_agent_instance("up").await.unwrap();
        assert_eq!(info.power, InstancePower::Running);
        assert_eq!(info.address.as_deref(), Some(open.as_str()));

        drop(listener);
        let info = provider.describe_agent_instance("up").await.unwrap();
        assert_eq!(info.power, InstancePower::Stopped);
    }

    #[tokio::test]
    async fn test_registration() {
        let provider = StaticResourceProvider::new(8443);
        assert_eq!(provider.register("ws", "10.1.2.3"), "10.1.2.3:8443");
        assert_eq!(provider.register("ws", "10.1.2.3:9000"), "10.1.2.3:9000");
        assert!(matches!(
            provider.describe_agent_instance("other").await,
            Err(ProviderError::UnknownAgent(_))
        ));
        assert!(provider.stop_agent_instance("ws").await.is_err());
        assert!(provider.unregister("ws"));
        assert!(!provider.unregister("ws"));
    }
}
