// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Domain
//!
//! The manager sees each remote agent through two seams:
//!
//! - [`ResourceProvider`](crate::domain::provider::ResourceProvider) answers
//!   whether the backing instance exists and is powered on.
//! - [`AgentApi`] talks to the agent process itself over the REST surface.
//!
//! [`AgentState`] is ordered so "at least started" comparisons read
//! naturally (`state >= AgentState::Started`).

use crate::domain::blob::{BlobError, BlobId, ResultKind};
use crate::domain::task::TaskStatusView;
use crate::domain::workload::Workload;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Unknown,
    Destroyed,
    Stopped,
    Started,
    Active,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Unknown => "UNKNOWN",
            AgentState::Destroyed => "DESTROYED",
            AgentState::Stopped => "STOPPED",
            AgentState::Started => "STARTED",
            AgentState::Active => "ACTIVE",
        };
        f.write_str(s)
    }
}

/// Payload of `GET status` on any node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub load: [f64; 3],
    pub memory_total: u64,
    pub memory_available: u64,
    pub disk_free: u64,
    pub cache_bytes: u64,
    pub running: Vec<String>,
    pub terminating: bool,
}

/// Persisted registration of a custom (local pool) agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    /// `host:port` of the agent's REST endpoint
    pub address: String,
}

/// Remote artifact being streamed back from an agent
pub struct ResultDownload {
    pub id: BlobId,
    pub size: u64,
    pub stream: BoxStream<'static, Result<Bytes, BlobError>>,
}

#[derive(Debug, Error)]
pub enum AgentApiError {
    #[error("Agent unreachable: {0}")]
    Unreachable(String),

    #[error("Agent responded with {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Not found on agent: {0}")]
    NotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Remote control surface of an agent process
///
/// Every call names the agent's current address explicitly; addresses
/// change when a backing instance is re-created.
#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn status(&self, address: &str) -> Result<NodeStatus, AgentApiError>;

    /// Create the sub-task from a workload; returns files the agent lacks
    async fn task_create(&self, address: &str, workload: &Workload)
        -> Result<Vec<String>, AgentApiError>;

    async fn upload_file(
        &self,
        address: &str,
        task: &str,
        path: &str,
        id: &BlobId,
        source: &Path,
        size: u64,
    ) -> Result<(), AgentApiError>;

    async fn task_run(&self, address: &str, task: &str) -> Result<(), AgentApiError>;

    async fn task_stop(&self, address: &str, task: &str) -> Result<(), AgentApiError>;

    async fn task_remove(&self, address: &str, task: &str) -> Result<(), AgentApiError>;

    async fn task_status(&self, address: &str, task: &str)
        -> Result<TaskStatusView, AgentApiError>;

    async fn task_details(&self, address: &str, task: &str)
        -> Result<serde_json::Value, AgentApiError>;

    async fn task_messages(&self, address: &str, task: &str)
        -> Result<serde_json::Value, AgentApiError>;

    async fn download_result(
        &self,
        address: &str,
        task: &str,
        kind: ResultKind,
    ) -> Result<ResultDownload, AgentApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(AgentState::Active > AgentState::Started);
        assert!(AgentState::Started > AgentState::Stopped);
        assert!(AgentState::Stopped > AgentState::Destroyed);
        assert!(AgentState::Destroyed > AgentState::Unknown);
    }

    #[test]
    fn test_state_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&AgentState::Active).unwrap(),
            "\"ACTIVE\""
        );
    }
}
