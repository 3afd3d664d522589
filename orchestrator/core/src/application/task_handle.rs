// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Shared handle to a live task
//!
//! Wraps the aggregate in a mutex and persists a snapshot after every
//! mutation that goes through [`TaskHandle::update`] or
//! [`TaskHandle::try_update`]. High-frequency progress updates use
//! [`TaskHandle::modify`] and reach disk with the next transition.

use crate::domain::repository::TaskRepository;
use crate::domain::task::{Task, TaskState};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub struct TaskHandle {
    name: String,
    task: Mutex<Task>,
    repo: Arc<dyn TaskRepository>,
    cancel: Mutex<CancellationToken>,
}

impl TaskHandle {
    pub fn new(task: Task, repo: Arc<dyn TaskRepository>) -> Arc<Self> {
        Arc::new(Self {
            name: task.name.clone(),
            task: Mutex::new(task),
            repo,
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> Task {
        self.task.lock().clone()
    }

    pub fn state(&self) -> TaskState {
        self.task.lock().state()
    }

    pub fn read<R>(&self, f: impl FnOnce(&Task) -> R) -> R {
        f(&self.task.lock())
    }

    /// In-memory mutation without a persistence write
    pub fn modify<R>(&self, f: impl FnOnce(&mut Task) -> R) -> R {
        f(&mut self.task.lock())
    }

    pub async fn update<R>(&self, f: impl FnOnce(&mut Task) -> R) -> R {
        let result = self.modify(f);
        self.persist().await;
        result
    }

    /// Mutation that may fail; the snapshot is persisted either way since a
    /// failed integrity check still changes state
    pub async fn try_update<R, E>(&self, f: impl FnOnce(&mut Task) -> Result<R, E>) -> Result<R, E> {
        let result = self.modify(f);
        self.persist().await;
        result
    }

    pub async fn persist(&self) {
        let snapshot = self.snapshot();
        if let Err(e) = self.repo.save(&snapshot).await {
            warn!(task = %self.name, error = %e, "Failed to persist task snapshot");
        }
    }

    /// Fresh token for a new execution
    pub fn reset_cancel(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        token
    }

    pub fn request_stop(&self) {
        self.cancel.lock().cancel();
    }

    pub fn stop_requested(&self) -> bool {
        self.cancel.lock().is_cancelled()
    }
}
