// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Agent pool
//!
//! Owns the manager's [`AgentWorker`]s. Workers come from three places:
//! the node configuration, the persisted registry of custom agents, and
//! `PUT agent/*/config` at runtime. The last two only exist for the local
//! pool, where addresses are all the manager knows about an agent.

use crate::application::agent_supervisor::{AgentSummary, AgentWorker, SupervisorSettings};
use crate::application::splitter::WorkloadBroker;
use crate::domain::agent::{AgentApi, AgentRecord};
use crate::domain::node_config::StaticAgentConfig;
use crate::domain::provider::{BootstrapFile, ResourceProvider};
use crate::domain::repository::{AgentRegistry, RepositoryError};
use crate::domain::task::validate_task_name;
use crate::infrastructure::blob_cache::BlobCache;
use crate::infrastructure::static_provider::StaticResourceProvider;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Agent not found: {0}")]
    NotFound(String),

    #[error("Invalid agent name: {0}")]
    InvalidName(String),

    #[error("Agents of this pool are managed by the resource provider")]
    NotLocal,

    #[error("Agent registry error: {0}")]
    Registry(#[from] RepositoryError),
}

/// Where custom agents are registered, when the pool supports them
pub struct LocalPool {
    pub provider: Arc<StaticResourceProvider>,
    pub registry: Arc<dyn AgentRegistry>,
}

pub struct AgentPool {
    workers: RwLock<BTreeMap<String, Arc<AgentWorker>>>,
    provider: Arc<dyn ResourceProvider>,
    api: Arc<dyn AgentApi>,
    broker: Arc<WorkloadBroker>,
    blobs: Arc<BlobCache>,
    settings: SupervisorSettings,
    bootstrap: Vec<BootstrapFile>,
    local: Option<LocalPool>,
    shutdown: CancellationToken,
}

impl AgentPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn ResourceProvider>,
        api: Arc<dyn AgentApi>,
        broker: Arc<WorkloadBroker>,
        blobs: Arc<BlobCache>,
        settings: SupervisorSettings,
        bootstrap: Vec<BootstrapFile>,
        local: Option<LocalPool>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            workers: RwLock::new(BTreeMap::new()),
            provider,
            api,
            broker,
            blobs,
            settings,
            bootstrap,
            local,
            shutdown,
        }
    }

    pub fn broker(&self) -> &Arc<WorkloadBroker> {
        &self.broker
    }

    /// Restore persisted custom agents
    pub async fn load(&self) -> Result<usize, PoolError> {
        let Some(local) = &self.local else {
            return Ok(0);
        };
        let records = local.registry.load_all().await?;
        let count = records.len();
        for record in records {
            local.provider.register(&record.name, &record.address);
            self.add_worker(&record.name);
        }
        info!(agents = count, "Restored registered agents");
        Ok(count)
    }

    /// Agents listed in the node configuration; they are not persisted
    pub fn add_configured(&self, agents: &[StaticAgentConfig]) {
        for agent in agents {
            if let Some(local) = &self.local {
                local.provider.register(&agent.name, &agent.address);
            }
            self.add_worker(&agent.name);
        }
    }

    /// Start a worker for `name` unless one exists already
    pub fn add_worker(&self, name: &str) -> Arc<AgentWorker> {
        if let Some(worker) = self.workers.read().get(name) {
            return worker.clone();
        }
        let worker = AgentWorker::new(
            name,
            self.provider.clone(),
            self.api.clone(),
            self.broker.clone(),
            self.blobs.clone(),
            self.settings.clone(),
            self.bootstrap.clone(),
            self.shutdown.child_token(),
        );
        worker.spawn();
        self.workers
            .write()
            .insert(name.to_string(), worker.clone());
        info!(agent = %name, provider = self.provider.name(), "Agent worker added");
        worker
    }

    pub fn worker(&self, name: &str) -> Option<Arc<AgentWorker>> {
        self.workers.read().get(name).cloned()
    }

    pub fn workers(&self) -> Vec<Arc<AgentWorker>> {
        self.workers.read().values().cloned().collect()
    }

    pub fn summary(&self) -> BTreeMap<String, AgentSummary> {
        self.workers
            .read()
            .iter()
            .map(|(name, worker)| (name.clone(), worker.summary()))
            .collect()
    }

    /// Register (or re-address) a custom agent and persist it
    pub async fn register(&self, name: &str, address: &str) -> Result<AgentRecord, PoolError> {
        let local = self.local.as_ref().ok_or(PoolError::NotLocal)?;
        validate_task_name(name).map_err(|_| PoolError::InvalidName(name.to_string()))?;
        let address = local.provider.register(name, address);
        let record = AgentRecord {
            name: name.to_string(),
            address,
        };
        local.registry.save(&record).await?;
        let worker = self.add_worker(name);
        worker.activate_state_watcher();
        Ok(record)
    }

    /// Remove a custom agent; an in-flight sub-task is returned to its job
    pub async fn remove(&self, name: &str) -> Result<(), PoolError> {
        let local = self.local.as_ref().ok_or(PoolError::NotLocal)?;
        let worker = self
            .workers
            .write()
            .remove(name)
            .ok_or_else(|| PoolError::NotFound(name.to_string()))?;
        worker.disable();
        if let Some(workload) = worker.current_workload() {
            self.broker.workload_lost(&workload.parent, &workload.name);
            worker.release_workload(&workload.name);
        }
        local.provider.unregister(name);
        match local.registry.delete(name).await {
            Ok(()) | Err(RepositoryError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        info!(agent = %name, "Agent removed");
        Ok(())
    }

    /// Fire-and-forget deletion of every backing instance
    pub fn release_all(&self) {
        let workers = self.workers();
        info!(agents = workers.len(), "Releasing agent instances");
        for worker in workers {
            worker.disable();
            tokio::spawn(async move {
                worker.delete_instance().await;
            });
        }
    }
}
