// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Task Aggregate
//!
//! A task is the unit of work owned by one executor. Agent tasks run the
//! renderer locally; manager tasks split themselves into remote sub-jobs.
//! Both share this aggregate and its state machine.
//!
//! ## State Machine
//! ```text
//! CREATED ──► PENDING ──► RUNNING ──► COMPLETED
//!    ▲           │           ├──────► STOPPED ──► PENDING (resume)
//!    │           └─► STOPPED └──────► ERROR
//!  (new)
//! ```
//! `ERROR` is also reachable from `CREATED` and `PENDING` when the
//! integrity check fails. Every transition records a timestamp; callers
//! persist the snapshot after each one.

use crate::domain::blob::{BlobId, BlobIndex, ResultKind};
use crate::domain::path_sanitizer::{PathSanitizer, PathSanitizerError};
use crate::domain::task_config::{ConfigError, TaskConfig, TaskConfigOverrides};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Upper bound on retained message lines per source
pub const MAX_MESSAGES_PER_SOURCE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Created,
    Pending,
    Running,
    Completed,
    Stopped,
    Error,
}

impl TaskState {
    pub fn is_ended(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Stopped | TaskState::Error)
    }

    /// Whether `self → to` is a legal edge of the state machine
    pub fn can_transition(&self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Created, Pending)
                | (Stopped, Pending)
                | (Pending, Running)
                | (Pending, Stopped)
                | (Running, Completed)
                | (Running, Stopped)
                | (Running, Error)
                | (Created, Error)
                | (Pending, Error)
                | (Stopped, Error)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Created => "CREATED",
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Completed => "COMPLETED",
            TaskState::Stopped => "STOPPED",
            TaskState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Runs the renderer subprocess on this node
    Agent,
    /// Distributes workloads to remote agents and merges their results
    Manager,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub preview: Option<BlobId>,
    pub render: Option<BlobId>,
}

impl TaskResult {
    pub fn get(&self, kind: ResultKind) -> Option<&BlobId> {
        match kind {
            ResultKind::Preview => self.preview.as_ref(),
            ResultKind::Render => self.render.as_ref(),
        }
    }

    /// Replace one slot, returning the previous value
    pub fn set(&mut self, kind: ResultKind, id: Option<BlobId>) -> Option<BlobId> {
        match kind {
            ResultKind::Preview => std::mem::replace(&mut self.preview, id),
            ResultKind::Render => std::mem::replace(&mut self.render, id),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub samples_done: u32,
    /// Estimated seconds until completion
    pub remaining: Option<u64>,
    pub result: TaskResult,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid task name: {0}")]
    InvalidName(String),

    #[error("Invalid transition for task {name}: {from} -> {to}")]
    InvalidTransition {
        name: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("Task {0} is active; stop it first")]
    Busy(String),

    #[error("Integrity check failed: {}", .0.join("; "))]
    Integrity(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Path(#[from] PathSanitizerError),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub kind: TaskKind,
    config: TaskConfigOverrides,
    state: TaskState,
    pub status: TaskStatus,
    files: BTreeMap<String, BlobId>,
    #[serde(default)]
    state_error_info: Vec<String>,
    /// Diagnostic payloads keyed by sub-task (or `"renderer"`)
    #[serde(default)]
    pub execution_details: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    messages: BTreeMap<String, Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(name: impl Into<String>, kind: TaskKind) -> Result<Self, TaskError> {
        let name = name.into();
        validate_task_name(&name)?;
        Ok(Self {
            name,
            kind,
            config: TaskConfigOverrides::default(),
            state: TaskState::Created,
            status: TaskStatus::default(),
            files: BTreeMap::new(),
            state_error_info: Vec::new(),
            execution_details: BTreeMap::new(),
            messages: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        })
    }

    /// Rebuild a task from its persisted snapshot
    ///
    /// No process survives a restart, so a snapshot claiming `RUNNING` is
    /// coerced to `STOPPED`.
    pub fn restore(mut snapshot: Task) -> Self {
        if snapshot.state == TaskState::Running {
            tracing::info!(task = %snapshot.name, "Coercing restored RUNNING task to STOPPED");
            snapshot.state = TaskState::Stopped;
            snapshot.ended_at = Some(Utc::now());
        }
        snapshot
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_ended(&self) -> bool {
        self.state.is_ended()
    }

    /// Configuration and file map may only change while nothing executes
    pub fn is_editable(&self) -> bool {
        matches!(self.state, TaskState::Created | TaskState::Stopped)
    }

    pub fn config(&self) -> TaskConfig {
        self.config.resolve()
    }

    pub fn overrides(&self) -> &TaskConfigOverrides {
        &self.config
    }

    pub fn set_config(
        &mut self,
        values: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), TaskError> {
        self.ensure_editable()?;
        self.config.apply(values)?;
        Ok(())
    }

    pub fn replace_config(&mut self, overrides: TaskConfigOverrides) -> Result<(), TaskError> {
        self.ensure_editable()?;
        self.config = overrides;
        Ok(())
    }

    pub fn files(&self) -> &BTreeMap<String, BlobId> {
        &self.files
    }

    /// Register a dependency file; the path is stored in canonical form
    pub fn set_file(&mut self, path: &str, id: BlobId) -> Result<(), TaskError> {
        self.ensure_editable()?;
        let key = PathSanitizer::new().canonical_key(path)?;
        self.files.insert(key, id);
        Ok(())
    }

    pub fn state_error_info(&self) -> &[String] {
        &self.state_error_info
    }

    pub fn messages(&self) -> &BTreeMap<String, Vec<String>> {
        &self.messages
    }

    pub fn push_message(&mut self, source: &str, line: impl Into<String>) {
        let lines = self.messages.entry(source.to_string()).or_default();
        lines.push(line.into());
        if lines.len() > MAX_MESSAGES_PER_SOURCE {
            let excess = lines.len() - MAX_MESSAGES_PER_SOURCE;
            lines.drain(..excess);
        }
    }

    pub fn set_messages(&mut self, source: &str, lines: Vec<String>) {
        self.messages.insert(source.to_string(), lines);
    }

    /// Integrity check: every file path stays inside the workspace and its
    /// blob is present; the project file is part of the file map.
    ///
    /// Failures are appended to `state_error_info` and force `ERROR`.
    pub fn check(&mut self, blobs: &dyn BlobIndex) -> Result<(), TaskError> {
        let problems = self.integrity_problems(blobs);
        if problems.is_empty() {
            return Ok(());
        }
        for problem in &problems {
            tracing::warn!(task = %self.name, problem = %problem, "Task integrity check failed");
        }
        self.state_error_info.extend(problems.iter().cloned());
        self.state = TaskState::Error;
        self.ended_at = Some(Utc::now());
        Err(TaskError::Integrity(problems))
    }

    /// Files whose blobs are not yet known to `blobs`
    pub fn missing_files(&self, blobs: &dyn BlobIndex) -> Vec<String> {
        self.files
            .iter()
            .filter(|(_, id)| !blobs.contains_blob(id))
            .map(|(path, _)| path.clone())
            .collect()
    }

    fn integrity_problems(&self, blobs: &dyn BlobIndex) -> Vec<String> {
        let sanitizer = PathSanitizer::new();
        let mut problems = Vec::new();

        for (path, id) in &self.files {
            if let Err(e) = sanitizer.normalize(path) {
                problems.push(format!("{}: {}", path, e));
            } else if !blobs.contains_blob(id) {
                problems.push(format!("{}: blob {} is not in the cache", path, id));
            }
        }

        let project = self.config().project;
        if project.is_empty() {
            problems.push("project file is not configured".to_string());
        } else {
            match sanitizer.canonical_key(&project) {
                Ok(key) if self.files.contains_key(&key) => {}
                Ok(key) => problems.push(format!("project file {} is not in the file map", key)),
                Err(e) => problems.push(format!("project: {}", e)),
            }
        }
        problems
    }

    fn ensure_editable(&self) -> Result<(), TaskError> {
        if self.is_editable() {
            Ok(())
        } else {
            Err(TaskError::Busy(self.name.clone()))
        }
    }

    fn transition(&mut self, to: TaskState) -> Result<(), TaskError> {
        if !self.state.can_transition(to) {
            return Err(TaskError::InvalidTransition {
                name: self.name.clone(),
                from: self.state,
                to,
            });
        }
        tracing::debug!(task = %self.name, from = %self.state, to = %to, "Task state transition");
        self.state = to;
        Ok(())
    }

    pub fn mark_pending(&mut self) -> Result<(), TaskError> {
        self.transition(TaskState::Pending)?;
        self.state_error_info.clear();
        self.ended_at = None;
        Ok(())
    }

    /// Executor-only: the task now owns the execution slot
    pub fn mark_running(&mut self) -> Result<(), TaskError> {
        self.transition(TaskState::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn state_complete(&mut self) -> Result<(), TaskError> {
        self.transition(TaskState::Completed)?;
        self.status.remaining = Some(0);
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn state_stop(&mut self) -> Result<(), TaskError> {
        self.transition(TaskState::Stopped)?;
        self.status.remaining = None;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn state_error(&mut self, info: impl Into<String>) -> Result<(), TaskError> {
        self.transition(TaskState::Error)?;
        self.state_error_info.push(info.into());
        self.status.remaining = None;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Blobs that must outlive eviction while the task exists: the final
    /// render plus every sub-task render recorded in the execution details
    pub fn protected_blobs(&self) -> Vec<BlobId> {
        let sub_renders = self
            .execution_details
            .values()
            .filter_map(|d| d.get("render").and_then(|r| r.as_str()))
            .filter_map(|r| BlobId::parse(r).ok());
        self.status
            .result
            .render
            .iter()
            .cloned()
            .chain(sub_renders)
            .collect()
    }

    pub fn summary(&self) -> TaskSummary {
        let config = self.config();
        TaskSummary {
            kind: self.kind,
            state: self.state,
            project: config.project,
            samples: config.samples,
            samples_done: self.status.samples_done,
            remaining: self.status.remaining,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }

    pub fn status_view(&self) -> TaskStatusView {
        TaskStatusView {
            state: self.state,
            samples_done: self.status.samples_done,
            remaining: self.status.remaining,
            result: self.status.result.clone(),
            state_error_info: self.state_error_info.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

/// Compact listing entry for `GET task`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub kind: TaskKind,
    pub state: TaskState,
    pub project: String,
    pub samples: u32,
    pub samples_done: u32,
    pub remaining: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Payload of `GET task/*/status`; also what the manager polls from agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub state: TaskState,
    pub samples_done: u32,
    pub remaining: Option<u64>,
    pub result: TaskResult,
    #[serde(default)]
    pub state_error_info: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Task names end up in URLs and directory names
pub fn validate_task_name(name: &str) -> Result<(), TaskError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(TaskError::InvalidName(name.to_string()))
    }
}
