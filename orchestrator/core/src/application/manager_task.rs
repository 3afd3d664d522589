// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Manager task execution
//!
//! A running manager task is a [`SplitJob`] registered with the pool's
//! broker, from which idle agents pull workloads. This strategy is the
//! execution watcher on top of it:
//!
//! ```text
//!   every tick
//!     ├─ poll each outstanding sub-task on its agent
//!     │    ├─ running   → queue preview download, preemption check
//!     │    ├─ ended     → details, messages, queue render download
//!     │    └─ ERROR     → fail the parent
//!     ├─ refresh preview and render merges
//!     └─ publish progress into the task
//! ```
//!
//! Stopping asks every agent for a partial result and keeps watching, for
//! at most the grace period, so those results still make it into the
//! merged render a later resume builds on.

use crate::application::agent_pool::AgentPool;
use crate::application::agent_supervisor::AgentWorker;
use crate::application::executor::{TaskOutcome, TaskStrategy};
use crate::application::merger::MergeTracker;
use crate::application::splitter::{SplitJob, SubTask};
use crate::application::task_handle::TaskHandle;
use crate::domain::agent::{AgentApi, AgentApiError, AgentState};
use crate::domain::blob::ResultKind;
use crate::domain::merger::ResultMerger;
use crate::domain::task::{TaskKind, TaskState, TaskStatusView};
use crate::infrastructure::blob_cache::BlobCache;
use crate::infrastructure::blob_reaper::BlobReaper;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub tick: Duration,
    /// How long a stopping task keeps collecting partial results
    pub stop_grace: Duration,
    /// Seconds of slack a sub-task needs before its agent is reclaimed
    pub preemption_margin: u64,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            stop_grace: Duration::from_secs(60),
            preemption_margin: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptionAction {
    Continue,
    /// Ask the agent to stop now and keep what it rendered
    Partial,
    /// Nothing rendered yet; hand the samples to another agent
    Abandon,
}

pub fn preemption_action(
    seconds_left: u64,
    remaining: Option<u64>,
    samples_done: u32,
    margin: u64,
) -> PreemptionAction {
    let fits = match remaining {
        Some(remaining) => remaining.saturating_add(margin) <= seconds_left,
        None => seconds_left > margin,
    };
    if fits {
        PreemptionAction::Continue
    } else if samples_done > 0 {
        PreemptionAction::Partial
    } else {
        PreemptionAction::Abandon
    }
}

/// State of one execution of one manager task
struct Execution {
    task: Arc<TaskHandle>,
    job: Arc<SplitJob>,
    preview: Arc<MergeTracker>,
    render: Arc<MergeTracker>,
    /// Sub-tasks already asked for an early partial result
    stopping: HashSet<String>,
}

pub struct ManagerTaskStrategy {
    pool: Arc<AgentPool>,
    blobs: Arc<BlobCache>,
    reaper: BlobReaper,
    merger: Arc<dyn ResultMerger>,
    settings: ManagerSettings,
}

impl ManagerTaskStrategy {
    pub fn new(
        pool: Arc<AgentPool>,
        blobs: Arc<BlobCache>,
        reaper: BlobReaper,
        merger: Arc<dyn ResultMerger>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            pool,
            blobs,
            reaper,
            merger,
            settings,
        }
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    fn tracker(&self, task: &str, kind: ResultKind) -> Arc<MergeTracker> {
        MergeTracker::new(
            task,
            kind,
            self.merger.clone(),
            self.blobs.clone(),
            self.reaper.clone(),
        )
    }

    async fn supervise(&self, run: &mut Execution, cancel: &CancellationToken) -> TaskOutcome {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return self.wind_down(run, None).await,
                _ = tokio::time::sleep(self.settings.tick) => {}
            }
            if let Err(reason) = self.watch(run).await {
                return self.wind_down(run, Some(reason)).await;
            }
            self.publish(run).await;

            let contributors = run.job.contributors(ResultKind::Render);
            if run.job.is_complete() && run.render.is_current(&contributors) {
                self.pool.broker().unregister(run.job.name());
                self.finalize(run).await;
                info!(task = %run.task.name(), samples = run.job.samples_secured(), "Render complete");
                return TaskOutcome::Completed;
            }
        }
    }

    /// Poll every outstanding sub-task once
    ///
    /// Returns the failure reason when a sub-task ended in `ERROR`.
    async fn watch(&self, run: &mut Execution) -> Result<(), String> {
        for sub in run.job.outstanding() {
            let Some(worker) = self.pool.worker(&sub.agent) else {
                run.job.workload_failed(&sub.name);
                continue;
            };
            if worker.state() < AgentState::Started {
                run.job.workload_failed(&sub.name);
                worker.release_workload(&sub.name);
                continue;
            }
            let (AgentState::Active, Some(address)) = (worker.state(), worker.address()) else {
                continue;
            };

            let view = match worker.api().task_status(&address, &sub.name).await {
                Ok(view) => view,
                // Not created yet: the worker is still pushing the workload
                Err(AgentApiError::NotFound(_)) if sub.state == TaskState::Created => continue,
                Err(AgentApiError::NotFound(_)) => {
                    warn!(subtask = %sub.name, agent = %sub.agent, "Sub-task vanished from its agent");
                    run.job.workload_failed(&sub.name);
                    worker.release_workload(&sub.name);
                    continue;
                }
                Err(e) => {
                    debug!(subtask = %sub.name, error = %e, "Sub-task status unavailable");
                    continue;
                }
            };
            run.job.update_status(&sub.name, &view);

            match view.state {
                TaskState::Error => {
                    self.collect_diagnostics(run, &worker, &address, &sub.name).await;
                    run.job.mark_finished(&sub.name);
                    worker.release_workload(&sub.name);
                    spawn_remote_remove(worker.api().clone(), address, sub.name.clone());
                    return Err(format!(
                        "sub-task {} failed on {}: {}",
                        sub.name,
                        sub.agent,
                        view.state_error_info.join("; ")
                    ));
                }
                TaskState::Completed | TaskState::Stopped => {
                    self.finish_subtask(run, &worker, &address, &sub, &view).await;
                }
                _ => {
                    if view.result.preview.is_some() && view.result.preview != sub.preview {
                        self.queue_preview(run, &worker, &sub.name);
                    }
                    self.check_preemption(run, &worker, &address, &sub, &view).await;
                }
            }
        }
        Ok(())
    }

    fn queue_preview(&self, run: &Execution, worker: &AgentWorker, subtask: &str) {
        let job = run.job.clone();
        let reaper = self.reaper.clone();
        let name = subtask.to_string();
        worker.queue_download(
            subtask,
            ResultKind::Preview,
            // A failed download clears the sub-task's stale preview
            Box::new(move |id| {
                if let Some(superseded) = job.set_subtask_result(&name, ResultKind::Preview, id) {
                    reaper.reap(superseded);
                }
            }),
        );
    }

    async fn finish_subtask(
        &self,
        run: &Execution,
        worker: &Arc<AgentWorker>,
        address: &str,
        sub: &SubTask,
        view: &TaskStatusView,
    ) {
        self.collect_diagnostics(run, worker, address, &sub.name).await;
        run.job.mark_finished(&sub.name);
        let samples_done = run.job.subtask(&sub.name).map(|s| s.samples_done).unwrap_or(0);
        info!(
            subtask = %sub.name,
            agent = %sub.agent,
            state = %view.state,
            samples_done,
            "Sub-task ended"
        );

        if samples_done > 0 && view.result.render.is_some() {
            run.job.download_started();
            let job = run.job.clone();
            let blobs = self.blobs.clone();
            let reaper = self.reaper.clone();
            let api = worker.api().clone();
            let address = address.to_string();
            let name = sub.name.clone();
            worker.queue_download(
                &sub.name,
                ResultKind::Render,
                Box::new(move |id| {
                    if let Some(id) = id.clone() {
                        let blobs = blobs.clone();
                        tokio::spawn(async move {
                            if let Err(e) = blobs.set_dnd(&id, true).await {
                                warn!(blob = %id, error = %e, "Failed to protect sub-task render");
                            }
                        });
                    }
                    if let Some(superseded) = job.set_subtask_result(&name, ResultKind::Render, id) {
                        reaper.reap(superseded);
                    }
                    job.download_finished();
                    spawn_remote_remove(api, address, name);
                }),
            );
        } else {
            if samples_done > 0 {
                run.job.set_subtask_result(&sub.name, ResultKind::Render, None);
            }
            spawn_remote_remove(worker.api().clone(), address.to_string(), sub.name.clone());
        }
        worker.release_workload(&sub.name);
    }

    /// Copy remote details and messages of a sub-task into the parent
    async fn collect_diagnostics(&self, run: &Execution, worker: &AgentWorker, address: &str, subtask: &str) {
        match worker.api().task_details(address, subtask).await {
            Ok(details) => run.job.set_subtask_details(subtask, details),
            Err(e) => debug!(subtask, error = %e, "Sub-task details unavailable"),
        }
        match worker.api().task_messages(address, subtask).await {
            Ok(messages) => {
                let lines = flatten_messages(&messages);
                run.task.modify(|t| t.set_messages(subtask, lines));
            }
            Err(e) => debug!(subtask, error = %e, "Sub-task messages unavailable"),
        }
    }

    async fn check_preemption(
        &self,
        run: &mut Execution,
        worker: &Arc<AgentWorker>,
        address: &str,
        sub: &SubTask,
        view: &TaskStatusView,
    ) {
        if run.stopping.contains(&sub.name) {
            return;
        }
        let Some(seconds_left) = worker.seconds_until_termination().await else {
            return;
        };
        match preemption_action(
            seconds_left,
            view.remaining,
            view.samples_done,
            self.settings.preemption_margin,
        ) {
            PreemptionAction::Continue => {}
            PreemptionAction::Partial => {
                warn!(
                    subtask = %sub.name,
                    agent = %sub.agent,
                    seconds_left,
                    samples_done = view.samples_done,
                    "Agent about to be reclaimed; requesting partial result"
                );
                if let Err(e) = worker.api().task_stop(address, &sub.name).await {
                    warn!(subtask = %sub.name, error = %e, "Failed to stop sub-task");
                }
                run.stopping.insert(sub.name.clone());
            }
            PreemptionAction::Abandon => {
                warn!(
                    subtask = %sub.name,
                    agent = %sub.agent,
                    seconds_left,
                    "Agent about to be reclaimed before rendering anything; abandoning sub-task"
                );
                run.job.workload_failed(&sub.name);
                worker.release_workload(&sub.name);
                spawn_remote_remove(worker.api().clone(), address.to_string(), sub.name.clone());
            }
        }
    }

    /// Refresh merges and copy progress into the task
    async fn publish(&self, run: &Execution) {
        run.preview.refresh(run.job.contributors(ResultKind::Preview));
        run.render.refresh(run.job.contributors(ResultKind::Render));

        let samples_done = run.job.samples_done();
        let remaining = run.job.estimate_remaining();
        let preview = run.preview.current();
        let render = run.render.current();
        let changed = run.task.modify(|t| {
            let before = (t.status.samples_done, t.status.result.clone());
            t.status.samples_done = samples_done;
            t.status.remaining = remaining;
            if preview.is_some() {
                t.status.result.preview = preview;
            }
            if render.is_some() {
                t.status.result.render = render;
            }
            before != (t.status.samples_done, t.status.result.clone())
        });
        if changed {
            run.task.persist().await;
        }
    }

    /// Leave the task with a render covering exactly the secured samples
    async fn finalize(&self, run: &Execution) {
        let secured = run.job.samples_secured();
        let preview = run.preview.current();
        let render = run.render.current();
        run.task
            .update(|t| {
                t.status.samples_done = secured;
                if preview.is_some() {
                    t.status.result.preview = preview;
                }
                if render.is_some() {
                    t.status.result.render = render;
                }
            })
            .await;
    }

    async fn wind_down(&self, run: &mut Execution, failure: Option<String>) -> TaskOutcome {
        self.pool.broker().unregister(run.job.name());
        match &failure {
            Some(reason) => error!(task = %run.task.name(), reason = %reason, "Render failed; stopping sub-tasks"),
            None => info!(task = %run.task.name(), "Stopping render"),
        }

        for sub in run.job.outstanding() {
            let Some(worker) = self.pool.worker(&sub.agent) else {
                continue;
            };
            if let Some(address) = worker.address() {
                if let Err(e) = worker.api().task_stop(&address, &sub.name).await {
                    debug!(subtask = %sub.name, error = %e, "Remote stop failed");
                }
            }
        }

        let deadline = Instant::now() + self.settings.stop_grace;
        while Instant::now() < deadline {
            let contributors = run.job.contributors(ResultKind::Render);
            if run.job.is_idle() && run.render.is_current(&contributors) && !run.preview.is_busy() {
                break;
            }
            tokio::time::sleep(self.settings.tick).await;
            if let Err(reason) = self.watch(run).await {
                warn!(task = %run.task.name(), reason = %reason, "Sub-task failed while stopping");
            }
            self.publish(run).await;
        }

        for sub in run.job.outstanding() {
            warn!(subtask = %sub.name, agent = %sub.agent, "Sub-task did not wind up in time; dropped");
            run.job.workload_failed(&sub.name);
            if let Some(worker) = self.pool.worker(&sub.agent) {
                worker.release_workload(&sub.name);
            }
        }
        self.finalize(run).await;

        match failure {
            Some(reason) => TaskOutcome::Failed(reason),
            None => TaskOutcome::Stopped,
        }
    }
}

#[async_trait]
impl TaskStrategy for ManagerTaskStrategy {
    fn kind(&self) -> TaskKind {
        TaskKind::Manager
    }

    async fn execute(&self, task: Arc<TaskHandle>, cancel: CancellationToken) -> TaskOutcome {
        let job = SplitJob::new(task.clone());
        let mut run = Execution {
            preview: self.tracker(task.name(), ResultKind::Preview),
            render: self.tracker(task.name(), ResultKind::Render),
            task,
            job: job.clone(),
            stopping: HashSet::new(),
        };
        self.pool.broker().register(job);
        let outcome = self.supervise(&mut run, &cancel).await;
        self.pool.broker().unregister(run.job.name());
        outcome
    }

    fn release(&self) {
        self.pool.release_all();
    }
}

fn spawn_remote_remove(api: Arc<dyn AgentApi>, address: String, subtask: String) {
    tokio::spawn(async move {
        if let Err(e) = api.task_remove(&address, &subtask).await {
            debug!(subtask = %subtask, error = %e, "Remote sub-task removal failed");
        }
    });
}

/// Agents report messages per source; the parent keeps one list per
/// sub-task
fn flatten_messages(messages: &serde_json::Value) -> Vec<String> {
    let lines = |v: &serde_json::Value| -> Vec<String> {
        v.as_array()
            .map(|a| a.iter().filter_map(|l| l.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    };
    match messages {
        serde_json::Value::Object(map) => map.values().flat_map(lines).collect(),
        other => lines(other),
    }
}
