// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Agent task execution
//!
//! Runs the renderer for one task inside a hard-linked workspace and feeds
//! its progress protocol back into the task:
//!
//! - `PROGRESS` updates `samples_done`
//! - `PREVIEW` / `RENDER` files are ingested into the blob cache
//! - everything else becomes a `renderer` message
//!
//! Stopping is two-staged: SIGINT so the renderer can write a partial
//! result, then SIGKILL after the grace period. A renderer that has not
//! reported any progress is killed immediately.

use crate::application::executor::{TaskOutcome, TaskStrategy};
use crate::application::task_handle::TaskHandle;
use crate::domain::blob::{BlobId, ResultKind};
use crate::domain::renderer::{ProgressEvent, RenderExit, RenderProcess, Renderer};
use crate::domain::task::TaskKind;
use crate::domain::task_config::TaskConfig;
use crate::infrastructure::blob_cache::BlobCache;
use crate::infrastructure::blob_reaper::BlobReaper;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const JOB_FILE: &str = "job.json";
pub const OUTPUT_DIR: &str = "output";
const MESSAGE_SOURCE: &str = "renderer";

enum StopStep {
    Interrupt,
    Kill,
}

/// Contents of `job.json`
#[derive(Debug, Clone, Serialize)]
pub struct RenderJob {
    pub project: PathBuf,
    pub samples: u32,
    pub seed: u32,
    pub frame: i32,
    pub output_dir: PathBuf,
}

impl RenderJob {
    pub fn new(workspace: &Path, config: &TaskConfig) -> Self {
        Self {
            project: workspace.join(&config.project),
            samples: config.samples,
            seed: config.seed,
            frame: config.frame,
            output_dir: workspace.join(OUTPUT_DIR),
        }
    }
}

pub struct AgentTaskStrategy {
    renderer: Arc<dyn Renderer>,
    blobs: Arc<BlobCache>,
    reaper: BlobReaper,
    stop_grace: Duration,
}

impl AgentTaskStrategy {
    pub fn new(
        renderer: Arc<dyn Renderer>,
        blobs: Arc<BlobCache>,
        reaper: BlobReaper,
        stop_grace: Duration,
    ) -> Self {
        Self {
            renderer,
            blobs,
            reaper,
            stop_grace,
        }
    }

    async fn prepare(&self, task: &TaskHandle) -> Result<(PathBuf, PathBuf), String> {
        let (files, config) = task.read(|t| (t.files().clone(), t.config()));
        let workspace = self
            .blobs
            .workspace_create(task.name(), &files)
            .await
            .map_err(|e| format!("failed to create workspace: {}", e))?;

        let job = RenderJob::new(&workspace, &config);
        tokio::fs::create_dir_all(&job.output_dir)
            .await
            .map_err(|e| format!("failed to create output directory: {}", e))?;
        let job_file = workspace.join(JOB_FILE);
        let raw = serde_json::to_vec_pretty(&job).map_err(|e| e.to_string())?;
        tokio::fs::write(&job_file, raw)
            .await
            .map_err(|e| format!("failed to write {}: {}", JOB_FILE, e))?;
        Ok((workspace, job_file))
    }

    async fn run_renderer(
        &self,
        task: &TaskHandle,
        workspace: &Path,
        job_file: &Path,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        let mut process = match self.renderer.launch(workspace, job_file).await {
            Ok(process) => process,
            Err(e) => return TaskOutcome::Failed(e.to_string()),
        };

        let mut grace_deadline: Option<Instant> = None;
        let mut killed = false;
        loop {
            let step = tokio::select! {
                line = process.next_line() => match line {
                    Some(line) => {
                        self.handle_line(task, workspace, &line).await;
                        continue;
                    }
                    None => break,
                },
                _ = cancel.cancelled(), if grace_deadline.is_none() => StopStep::Interrupt,
                _ = tokio::time::sleep_until(grace_deadline.unwrap_or_else(Instant::now)),
                    if grace_deadline.is_some() => StopStep::Kill,
            };
            match step {
                StopStep::Interrupt => {
                    grace_deadline = Some(Instant::now() + self.stop_grace);
                    self.begin_stop(task, process.as_mut()).await;
                }
                StopStep::Kill => {
                    warn!(task = %task.name(), "Renderer ignored interrupt; killing");
                    self.kill(task, process.as_mut()).await;
                    killed = true;
                    break;
                }
            }
        }
        let stop_sent = grace_deadline.is_some();

        let exit = match grace_deadline {
            Some(deadline) if !killed => {
                match tokio::time::timeout_at(deadline, process.wait()).await {
                    Ok(exit) => exit,
                    Err(_) => {
                        warn!(task = %task.name(), "Renderer ignored interrupt; killing");
                        self.kill(task, process.as_mut()).await;
                        process.wait().await
                    }
                }
            }
            _ => process.wait().await,
        };

        match exit {
            Err(e) => TaskOutcome::Failed(format!("failed to reap renderer: {}", e)),
            Ok(_) if stop_sent => TaskOutcome::Stopped,
            Ok(RenderExit::Success) => TaskOutcome::Completed,
            Ok(RenderExit::Code(code)) => {
                TaskOutcome::Failed(format!("renderer exited with code {}", code))
            }
            Ok(RenderExit::Signal(signal)) => TaskOutcome::Failed(format!(
                "renderer killed by signal {} (likely out of memory)",
                signal
            )),
        }
    }

    async fn begin_stop(&self, task: &TaskHandle, process: &mut dyn RenderProcess) {
        let samples_done = task.read(|t| t.status.samples_done);
        if samples_done == 0 {
            info!(task = %task.name(), "Stopping renderer without progress; killing");
            self.kill(task, process).await;
            return;
        }
        info!(task = %task.name(), samples_done, "Interrupting renderer for partial result");
        if let Err(e) = process.interrupt() {
            warn!(task = %task.name(), error = %e, "Failed to interrupt renderer; killing");
            self.kill(task, process).await;
        }
    }

    async fn kill(&self, task: &TaskHandle, process: &mut dyn RenderProcess) {
        if let Err(e) = process.kill().await {
            warn!(task = %task.name(), error = %e, "Failed to kill renderer");
        }
    }

    async fn handle_line(&self, task: &TaskHandle, workspace: &Path, line: &str) {
        match ProgressEvent::parse(line) {
            ProgressEvent::Progress { done, .. } => {
                task.modify(|t| t.status.samples_done = done);
            }
            ProgressEvent::Remaining(seconds) => {
                task.modify(|t| t.status.remaining = Some(seconds));
            }
            ProgressEvent::Preview(path) => {
                self.ingest_result(task, workspace, &path, ResultKind::Preview)
                    .await
            }
            ProgressEvent::Render(path) => {
                self.ingest_result(task, workspace, &path, ResultKind::Render)
                    .await
            }
            ProgressEvent::Message(message) => {
                debug!(target: "renderer", task = %task.name(), "{}", message);
                task.modify(|t| t.push_message(MESSAGE_SOURCE, message));
            }
        }
    }

    async fn ingest_result(&self, task: &TaskHandle, workspace: &Path, path: &Path, kind: ResultKind) {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            workspace.join(path)
        };
        let meta = match self.blobs.store_file(&path).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!(task = %task.name(), kind = %kind, error = %e, "Failed to ingest renderer output");
                return;
            }
        };
        if kind == ResultKind::Render {
            if let Err(e) = self.blobs.set_dnd(&meta.id, true).await {
                warn!(task = %task.name(), error = %e, "Failed to protect render blob");
            }
        }

        let id = meta.id.clone();
        let previous = task
            .update(|t| t.status.result.set(kind, Some(id)))
            .await;
        debug!(task = %task.name(), kind = %kind, blob = %meta.id, "Stored renderer output");
        self.retire(previous, &meta.id);
    }

    fn retire(&self, previous: Option<BlobId>, current: &BlobId) {
        if let Some(previous) = previous {
            if &previous != current {
                self.reaper.reap(previous);
            }
        }
    }
}

#[async_trait]
impl TaskStrategy for AgentTaskStrategy {
    fn kind(&self) -> TaskKind {
        TaskKind::Agent
    }

    async fn execute(&self, task: Arc<TaskHandle>, cancel: CancellationToken) -> TaskOutcome {
        let (workspace, job_file) = match self.prepare(&task).await {
            Ok(paths) => paths,
            Err(reason) => {
                self.blobs.workspace_clean(task.name());
                return TaskOutcome::Failed(reason);
            }
        };
        let blobs = self.blobs.clone();
        let name = task.name().to_string();
        let _cleanup = scopeguard::guard((), move |_| blobs.workspace_clean(&name));

        self.run_renderer(&task, &workspace, &job_file, &cancel).await
    }
}
