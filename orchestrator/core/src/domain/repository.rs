// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for the two aggregates that outlive a process:
//! tasks and custom agent registrations. Implementations live in
//! `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `TaskRepository` | `Task` | `FileTaskRepository`, `InMemoryTaskRepository` |
//! | `AgentRegistry` | `AgentRecord` | `FileAgentRegistry`, `InMemoryAgentRegistry` |
//!
//! Both file implementations key snapshots by the SHA-1 of the name so any
//! name maps to a safe, fixed-length file name.

use crate::domain::agent::AgentRecord;
use crate::domain::task::Task;
use async_trait::async_trait;
use thiserror::Error;

#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Save task snapshot (create or update)
    async fn save(&self, task: &Task) -> Result<(), RepositoryError>;

    async fn load_all(&self) -> Result<Vec<Task>, RepositoryError>;

    async fn delete(&self, name: &str) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn save(&self, record: &AgentRecord) -> Result<(), RepositoryError>;

    async fn load_all(&self) -> Result<Vec<AgentRecord>, RepositoryError>;

    async fn delete(&self, name: &str) -> Result<(), RepositoryError>;
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
