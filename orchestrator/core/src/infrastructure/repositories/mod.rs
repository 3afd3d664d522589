// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the repository abstractions defined in
//! the domain layer.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve task snapshots and agent registrations
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! ## File Repositories
//!
//! One pretty-printed JSON document per entity under a session directory,
//! named by the SHA-1 of the entity name:
//! - **FileTaskRepository** - `<session>/tasks/<sha1>.json`
//! - **FileAgentRegistry** - `<session>/agents/<sha1>.json`
//!
//! ## In-Memory Repositories
//!
//! Lightweight implementations for testing:
//! - **InMemoryTaskRepository**
//! - **InMemoryAgentRegistry**

pub mod file;

pub use file::{FileAgentRegistry, FileTaskRepository};

use crate::domain::agent::AgentRecord;
use crate::domain::repository::{AgentRegistry, RepositoryError, TaskRepository};
use crate::domain::task::Task;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct InMemoryTaskRepository {
    tasks: Arc<RwLock<BTreeMap<String, Task>>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, name: &str) -> Option<Task> {
        self.tasks.read().get(name).cloned()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn save(&self, task: &Task) -> Result<(), RepositoryError> {
        self.tasks.write().insert(task.name.clone(), task.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Task>, RepositoryError> {
        Ok(self.tasks.read().values().cloned().collect())
    }

    async fn delete(&self, name: &str) -> Result<(), RepositoryError> {
        self.tasks.write().remove(name);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryAgentRegistry {
    agents: Arc<RwLock<BTreeMap<String, AgentRecord>>>,
}

impl InMemoryAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentRegistry for InMemoryAgentRegistry {
    async fn save(&self, record: &AgentRecord) -> Result<(), RepositoryError> {
        self.agents
            .write()
            .insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<AgentRecord>, RepositoryError> {
        Ok(self.agents.read().values().cloned().collect())
    }

    async fn delete(&self, name: &str) -> Result<(), RepositoryError> {
        self.agents.write().remove(name);
        Ok(())
    }
}
