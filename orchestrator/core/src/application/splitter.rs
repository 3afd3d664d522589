// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Job Splitter
//!
//! Splits a running manager task into workloads for remote agents and
//! keeps the per-sub-task bookkeeping the execution watcher needs.
//!
//! ## Sample accounting
//! ```text
//! samples ─┬─ base_done        secured by earlier executions (merged render)
//!          ├─ acquired         handed out to sub-tasks of this execution
//!          └─ available        still to be acquired
//! ```
//! A sub-task that ends with fewer samples than it acquired, or whose
//! agent disappears before its render is downloaded, releases the
//! difference back to `available`.

use crate::application::task_handle::TaskHandle;
use crate::domain::blob::{BlobId, ResultKind};
use crate::domain::task::{TaskState, TaskStatusView};
use crate::domain::task_config::TaskConfig;
use crate::domain::workload::{SampleLedger, Workload};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Manager-side view of one remote sub-task
#[derive(Debug, Clone)]
pub struct SubTask {
    pub name: String,
    pub agent: String,
    /// Samples acquired for this sub-task
    pub samples: u32,
    pub state: TaskState,
    pub samples_done: u32,
    pub remaining: Option<u64>,
    pub acquired_at: DateTime<Utc>,
    pub polled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub preview: Option<BlobId>,
    pub render: Option<BlobId>,
    /// The remote side reached a terminal state and was wound up
    pub finished: bool,
    /// The agent was lost; the sub-task contributes nothing further
    pub failed: bool,
    released: bool,
}

impl SubTask {
    fn new(name: String, agent: String, samples: u32) -> Self {
        Self {
            name,
            agent,
            samples,
            state: TaskState::Created,
            samples_done: 0,
            remaining: None,
            acquired_at: Utc::now(),
            polled_at: None,
            started_at: None,
            ended_at: None,
            preview: None,
            render: None,
            finished: false,
            failed: false,
            released: false,
        }
    }

    pub fn is_outstanding(&self) -> bool {
        !self.finished && !self.failed
    }

    /// Seconds per sample, from the completed run or the in-flight estimate
    pub fn seconds_per_sample(&self) -> Option<f64> {
        let started = self.started_at?;
        if self.state.is_ended() {
            let ended = self.ended_at?;
            if self.samples_done == 0 {
                return None;
            }
            let elapsed = (ended - started).num_milliseconds() as f64 / 1000.0;
            return Some(elapsed / self.samples_done as f64);
        }
        let polled = self.polled_at?;
        let remaining = self.remaining? as f64;
        if self.samples == 0 {
            return None;
        }
        let elapsed = (polled - started).num_milliseconds() as f64 / 1000.0;
        Some((elapsed + remaining) / self.samples as f64)
    }
}

pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

/// Per-execution split state of one manager task
///
/// Lock order: `ledger` before `subtasks`.
pub struct SplitJob {
    task: Arc<TaskHandle>,
    config: TaskConfig,
    files: BTreeMap<String, BlobId>,
    base_done: u32,
    /// Render merged by a previous execution; always a contributor
    carried: Option<BlobId>,
    ledger: Mutex<SampleLedger>,
    subtasks: Mutex<BTreeMap<String, SubTask>>,
    pending_downloads: AtomicUsize,
}

impl SplitJob {
    pub fn new(task: Arc<TaskHandle>) -> Arc<Self> {
        let (config, files, base_done, offset, carried) = task.read(|t| {
            (
                t.config(),
                t.files().clone(),
                t.status.samples_done,
                t.execution_details.len() as u32,
                t.status.result.render.clone(),
            )
        });
        let todo = config.samples.saturating_sub(base_done);
        let ledger = SampleLedger::resume(todo, config.workload_samples, offset);
        info!(
            task = %task.name(),
            samples = config.samples,
            base_done,
            workload_samples = config.workload_samples,
            "Split job prepared"
        );
        Arc::new(Self {
            task,
            config,
            files,
            base_done,
            carried: if base_done > 0 { carried } else { None },
            ledger: Mutex::new(ledger),
            subtasks: Mutex::new(BTreeMap::new()),
            pending_downloads: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }

    pub fn task(&self) -> &Arc<TaskHandle> {
        &self.task
    }

    pub fn has_work(&self) -> bool {
        !self.task.stop_requested() && self.ledger.lock().available() > 0
    }

    pub fn samples_available(&self) -> u32 {
        self.ledger.lock().available()
    }

    /// Atomically carve the next workload for `agent`
    pub fn acquire_workload(&self, agent: &str) -> Option<Workload> {
        if self.task.stop_requested() {
            return None;
        }
        let workload = {
            let mut ledger = self.ledger.lock();
            let (samples, index) = ledger.acquire()?;
            let workload = Workload::new(
                self.task.name(),
                index,
                samples,
                &self.config,
                self.files.clone(),
            );
            self.subtasks.lock().insert(
                workload.name.clone(),
                SubTask::new(workload.name.clone(), agent.to_string(), samples),
            );
            workload
        };
        self.task.modify(|t| {
            t.execution_details.insert(
                workload.name.clone(),
                json!({"agent": agent, "samples": workload.samples()}),
            )
        });
        info!(
            task = %self.task.name(),
            subtask = %workload.name,
            agent = %agent,
            samples = workload.samples(),
            seed = workload.config.seed,
            "Workload acquired"
        );
        Some(workload)
    }

    pub fn subtask(&self, name: &str) -> Option<SubTask> {
        self.subtasks.lock().get(name).cloned()
    }

    pub fn subtasks(&self) -> Vec<SubTask> {
        self.subtasks.lock().values().cloned().collect()
    }

    pub fn outstanding(&self) -> Vec<SubTask> {
        self.subtasks
            .lock()
            .values()
            .filter(|s| s.is_outstanding())
            .cloned()
            .collect()
    }

    /// Record a polled remote status; returns the previous remote state
    pub fn update_status(&self, name: &str, view: &TaskStatusView) -> Option<TaskState> {
        let mut subtasks = self.subtasks.lock();
        let sub = subtasks.get_mut(name)?;
        if sub.failed {
            return Some(sub.state);
        }
        let previous = sub.state;
        sub.state = view.state;
        sub.samples_done = view.samples_done.min(sub.samples);
        sub.remaining = view.remaining;
        sub.started_at = view.started_at.or(sub.started_at);
        sub.ended_at = view.ended_at;
        sub.polled_at = Some(Utc::now());
        Some(previous)
    }

    /// Wind up a sub-task whose remote side ended; unrendered samples go
    /// back to the ledger
    pub fn mark_finished(&self, name: &str) {
        let mut ledger = self.ledger.lock();
        let mut subtasks = self.subtasks.lock();
        let Some(sub) = subtasks.get_mut(name) else {
            return;
        };
        if sub.finished || sub.failed {
            return;
        }
        sub.finished = true;
        let unrendered = sub.samples.saturating_sub(sub.samples_done);
        if unrendered > 0 && !sub.released {
            ledger.release(unrendered);
            debug!(subtask = %name, unrendered, "Returned unrendered samples");
        }
        sub.samples = sub.samples_done;
    }

    /// The sub-task's agent went away; release everything not secured by a
    /// downloaded render and drop its partial results
    ///
    /// Idempotent. Returns the number of samples released.
    pub fn workload_failed(&self, name: &str) -> u32 {
        let mut ledger = self.ledger.lock();
        let mut subtasks = self.subtasks.lock();
        let Some(sub) = subtasks.get_mut(name) else {
            return 0;
        };
        if sub.failed {
            return 0;
        }
        let secured = if sub.render.is_some() && sub.finished {
            sub.samples_done
        } else {
            0
        };
        if secured > 0 {
            // Finished and downloaded: nothing was lost
            return 0;
        }
        let released = sub.samples;
        ledger.release(released);
        sub.failed = true;
        sub.released = true;
        sub.preview = None;
        sub.render = None;
        sub.samples_done = 0;
        sub.state = TaskState::Stopped;
        warn!(
            task = %self.task.name(),
            subtask = %name,
            agent = %sub.agent,
            released,
            "Sub-task lost; samples returned"
        );
        released
    }

    /// Attach a downloaded artifact; returns the blob it replaced
    ///
    /// A failed render download (`None`) forfeits the sub-task's samples.
    pub fn set_subtask_result(
        &self,
        name: &str,
        kind: ResultKind,
        id: Option<BlobId>,
    ) -> Option<BlobId> {
        let mut ledger = self.ledger.lock();
        let mut subtasks = self.subtasks.lock();
        let sub = subtasks.get_mut(name)?;
        if sub.failed {
            return id;
        }
        let previous = match kind {
            ResultKind::Preview => std::mem::replace(&mut sub.preview, id.clone()),
            ResultKind::Render => std::mem::replace(&mut sub.render, id.clone()),
        };

        if kind == ResultKind::Render {
            match &id {
                Some(render) => {
                    let render = render.to_string();
                    self.task.modify(|t| {
                        if let Some(details) = t.execution_details.get_mut(name) {
                            details["render"] = json!(render);
                        }
                    });
                }
                None if sub.samples_done > 0 => {
                    warn!(subtask = %name, samples = sub.samples_done, "Render download failed; samples forfeited");
                    ledger.release(sub.samples_done);
                    sub.samples_done = 0;
                    sub.samples = 0;
                }
                None => {}
            }
        }
        previous.filter(|p| Some(p) != id.as_ref())
    }

    /// Replace a sub-task's diagnostic payload, keeping the bookkeeping
    /// fields written at acquisition
    pub fn set_subtask_details(&self, name: &str, details: serde_json::Value) {
        self.task.modify(|t| {
            let entry = t
                .execution_details
                .entry(name.to_string())
                .or_insert_with(|| json!({}));
            if let Some(map) = entry.as_object_mut() {
                map.insert("remote".to_string(), details);
            }
        });
    }

    pub fn download_started(&self) {
        self.pending_downloads.fetch_add(1, Ordering::SeqCst);
    }

    pub fn download_finished(&self) {
        let _ = self
            .pending_downloads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn pending_downloads(&self) -> usize {
        self.pending_downloads.load(Ordering::SeqCst)
    }

    /// Blobs currently contributing to `kind`, oldest sub-task first
    ///
    /// Renders stand in for previews of sub-tasks that already finished.
    pub fn contributors(&self, kind: ResultKind) -> Vec<BlobId> {
        let subtasks = self.subtasks.lock();
        let mut ids: Vec<BlobId> = self.carried.iter().cloned().collect();
        for sub in subtasks.values().filter(|s| !s.failed) {
            let id = match kind {
                ResultKind::Render => sub.render.as_ref(),
                ResultKind::Preview => sub.render.as_ref().or(sub.preview.as_ref()),
            };
            if let Some(id) = id {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
            }
        }
        ids
    }

    /// Samples rendered so far, including earlier executions
    pub fn samples_done(&self) -> u32 {
        self.base_done
            + self
                .subtasks
                .lock()
                .values()
                .filter(|s| !s.failed)
                .map(|s| s.samples_done)
                .sum::<u32>()
    }

    /// Samples backed by a downloaded render
    pub fn samples_secured(&self) -> u32 {
        self.base_done
            + self
                .subtasks
                .lock()
                .values()
                .filter(|s| !s.failed && s.render.is_some())
                .map(|s| s.samples_done)
                .sum::<u32>()
    }

    pub fn estimate_remaining(&self) -> Option<u64> {
        let mut rates: Vec<f64> = self
            .subtasks
            .lock()
            .values()
            .filter(|s| !s.failed)
            .filter_map(|s| s.seconds_per_sample())
            .collect();
        let per_sample = median(&mut rates)?;
        let left = self.config.samples.saturating_sub(self.samples_done());
        Some((per_sample * left as f64).ceil() as u64)
    }

    /// First sub-task that ended in `ERROR`, with its reported reason
    pub fn failed_subtask(&self) -> Option<String> {
        self.subtasks
            .lock()
            .values()
            .find(|s| !s.failed && s.state == TaskState::Error)
            .map(|s| s.name.clone())
    }

    pub fn is_complete(&self) -> bool {
        let all_done = self.subtasks.lock().values().all(|s| !s.is_outstanding());
        all_done
            && self.pending_downloads() == 0
            && self.samples_secured() >= self.config.samples
    }

    /// Nothing left in flight: every sub-task wound up and downloads done
    pub fn is_idle(&self) -> bool {
        self.subtasks.lock().values().all(|s| !s.is_outstanding()) && self.pending_downloads() == 0
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }
}

/// Running split jobs, oldest first, from which idle agents pull work
#[derive(Default)]
pub struct WorkloadBroker {
    jobs: Mutex<Vec<Arc<SplitJob>>>,
}

impl WorkloadBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job: Arc<SplitJob>) {
        let mut jobs = self.jobs.lock();
        jobs.retain(|j| j.name() != job.name());
        jobs.push(job);
    }

    pub fn unregister(&self, name: &str) {
        self.jobs.lock().retain(|j| j.name() != name);
    }

    pub fn job(&self, name: &str) -> Option<Arc<SplitJob>> {
        self.jobs.lock().iter().find(|j| j.name() == name).cloned()
    }

    pub fn has_work(&self) -> bool {
        self.jobs.lock().iter().any(|j| j.has_work())
    }

    /// Pull the oldest acquirable workload from the oldest running job
    pub fn acquire(&self, agent: &str) -> Option<(Arc<SplitJob>, Workload)> {
        let jobs: Vec<Arc<SplitJob>> = self.jobs.lock().clone();
        jobs.into_iter()
            .find_map(|job| job.acquire_workload(agent).map(|w| (job, w)))
    }

    /// Report that `agent` lost the sub-task `name` of `parent`
    pub fn workload_lost(&self, parent: &str, name: &str) -> u32 {
        match self.job(parent) {
            Some(job) => job.workload_failed(name),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::{Task, TaskKind, TaskResult};
    use crate::infrastructure::repositories::InMemoryTaskRepository;
    use chrono::Duration as ChronoDuration;

    fn job(samples: u32, agents: u32) -> Arc<SplitJob> {
        let mut task = Task::new("shot", TaskKind::Manager).unwrap();
        task.set_config(
            json!({"project": "s.blend", "samples": samples, "agents_num": agents, "seed": 10})
                .as_object()
                .unwrap(),
        )
        .unwrap();
        SplitJob::new(TaskHandle::new(task, Arc::new(InMemoryTaskRepository::new())))
    }

    fn view(state: TaskState, done: u32) -> TaskStatusView {
        TaskStatusView {
            state,
            samples_done: done,
            remaining: None,
            result: TaskResult::default(),
            state_error_info: Vec::new(),
            started_at: None,
            ended_at: None,
        }
    }

    #[test]
    fn test_acquire_250_over_3() {
        let job = job(250, 3);
        let a = job.acquire_workload("a").unwrap();
        let b = job.acquire_workload("b").unwrap();
        let c = job.acquire_workload("c").unwrap();
        assert!(job.acquire_workload("d").is_none());

        assert_eq!((a.samples(), b.samples(), c.samples()), (84, 84, 82));
        assert_eq!((a.config.seed, b.config.seed, c.config.seed), (10, 11, 12));
        assert_eq!(c.name, "shot_2");
        assert_eq!(job.task().read(|t| t.execution_details.len()), 3);
    }

    #[test]
    fn test_concurrent_acquisition_never_over_acquires() {
        let job = job(1000, 7);
        let total = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        std::thread::scope(|scope| {
            for i in 0..8 {
                let job = job.clone();
                let total = total.clone();
                scope.spawn(move || {
                    while let Some(w) = job.acquire_workload(&format!("agent-{}", i)) {
                        total.fetch_add(w.samples(), Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(total.load(Ordering::SeqCst), 1000);
        assert_eq!(job.samples_available(), 0);
    }

    #[test]
    fn test_partial_finish_returns_unrendered_samples() {
        let job = job(100, 1);
        let w = job.acquire_workload("a").unwrap();
        assert_eq!(w.samples(), 100);
        job.update_status(&w.name, &view(TaskState::Stopped, 40));
        job.mark_finished(&w.name);
        job.mark_finished(&w.name);
        assert_eq!(job.samples_available(), 60);

        job.set_subtask_result(&w.name, ResultKind::Render, Some(BlobId::digest(b"r")));
        assert_eq!(job.samples_secured(), 40);
        let next = job.acquire_workload("a").unwrap();
        assert_eq!(next.samples(), 60);
        assert_eq!(next.name, "shot_1");
    }

    #[test]
    fn test_lost_workload_is_idempotent() {
        let job = job(200, 2);
        let w = job.acquire_workload("a").unwrap();
        job.update_status(&w.name, &view(TaskState::Running, 30));
        job.set_subtask_result(&w.name, ResultKind::Preview, Some(BlobId::digest(b"p")));

        assert_eq!(job.workload_failed(&w.name), 100);
        assert_eq!(job.workload_failed(&w.name), 0);
        let sub = job.subtask(&w.name).unwrap();
        assert!(sub.failed);
        assert_eq!(sub.state, TaskState::Stopped);
        assert!(sub.preview.is_none());
        assert_eq!(job.samples_done(), 0);
        assert!(job.contributors(ResultKind::Preview).is_empty());
        // status updates after the loss are ignored
        job.update_status(&w.name, &view(TaskState::Running, 50));
        assert_eq!(job.samples_done(), 0);
    }

    #[test]
    fn test_acquire_and_release_run_concurrently() {
        let job = job(100_000, 1000);
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let (tx, rx) = std::sync::mpsc::channel();

        let acquirer = {
            let job = job.clone();
            let stop = stop.clone();
            let tx = tx.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    job.acquire_workload("a");
                }
                let _ = tx.send(());
            })
        };
        let releaser = {
            let job = job.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    for sub in job.subtasks() {
                        job.workload_failed(&sub.name);
                        job.mark_finished(&sub.name);
                        job.set_subtask_result(&sub.name, ResultKind::Render, None);
                    }
                }
                let _ = tx.send(());
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(500));
        stop.store(true, Ordering::SeqCst);
        for _ in 0..2 {
            rx.recv_timeout(std::time::Duration::from_secs(5))
                .expect("splitter threads did not finish");
        }
        acquirer.join().unwrap();
        releaser.join().unwrap();
        assert!(job.samples_available() <= 100_000);
    }

    #[test]
    fn test_failed_render_download_forfeits_samples() {
        let job = job(100, 1);
        let w = job.acquire_workload("a").unwrap();
        job.update_status(&w.name, &view(TaskState::Completed, 100));
        job.mark_finished(&w.name);
        assert_eq!(job.samples_available(), 0);

        job.set_subtask_result(&w.name, ResultKind::Render, None);
        assert_eq!(job.samples_available(), 100);
        assert!(!job.is_complete());
    }

    #[test]
    fn test_superseded_preview_is_returned() {
        let job = job(100, 1);
        let w = job.acquire_workload("a").unwrap();
        let first = BlobId::digest(b"p1");
        let second = BlobId::digest(b"p2");
        assert_eq!(job.set_subtask_result(&w.name, ResultKind::Preview, Some(first.clone())), None);
        assert_eq!(
            job.set_subtask_result(&w.name, ResultKind::Preview, Some(second.clone())),
            Some(first)
        );
        assert_eq!(job.contributors(ResultKind::Preview), vec![second]);
    }

    #[test]
    fn test_completion_requires_downloads_and_samples() {
        let job = job(100, 1);
        let w = job.acquire_workload("a").unwrap();
        job.update_status(&w.name, &view(TaskState::Completed, 100));
        job.mark_finished(&w.name);
        job.download_started();
        assert!(!job.is_complete());
        job.set_subtask_result(&w.name, ResultKind::Render, Some(BlobId::digest(b"r")));
        job.download_finished();
        assert!(job.is_complete());
        let details = job.task().read(|t| t.execution_details["shot_0"].clone());
        assert_eq!(details["render"], BlobId::digest(b"r").to_string());
    }

    #[test]
    fn test_error_subtask_is_reported() {
        let job = job(100, 2);
        let w = job.acquire_workload("a").unwrap();
        assert!(job.failed_subtask().is_none());
        job.update_status(&w.name, &view(TaskState::Error, 0));
        assert_eq!(job.failed_subtask(), Some(w.name));
    }

    #[test]
    fn test_median_and_estimate() {
        let mut empty: [f64; 0] = [];
        assert_eq!(median(&mut empty), None);
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), Some(2.5));

        let job = job(200, 2);
        let a = job.acquire_workload("a").unwrap();
        let start = Utc::now() - ChronoDuration::seconds(100);
        let mut finished = view(TaskState::Completed, 100);
        finished.started_at = Some(start);
        finished.ended_at = Some(start + ChronoDuration::seconds(100));
        job.update_status(&a.name, &finished);
        // 1 s/sample over the 100 samples still to render
        assert_eq!(job.estimate_remaining(), Some(100));
    }

    #[test]
    fn test_resume_continues_numbering() {
        let mut task = Task::new("shot", TaskKind::Manager).unwrap();
        task.set_config(json!({"project": "s.blend", "samples": 100}).as_object().unwrap())
            .unwrap();
        task.status.samples_done = 60;
        task.status.result.render = Some(BlobId::digest(b"merged"));
        task.execution_details.insert("shot_0".to_string(), json!({}));
        let job = SplitJob::new(TaskHandle::new(task, Arc::new(InMemoryTaskRepository::new())));

        let w = job.acquire_workload("a").unwrap();
        assert_eq!(w.name, "shot_1");
        assert_eq!(w.samples(), 40);
        assert_eq!(job.contributors(ResultKind::Render), vec![BlobId::digest(b"merged")]);
    }

    #[test]
    fn test_broker_prefers_oldest_job() {
        let broker = WorkloadBroker::new();
        let first = job(50, 1);
        broker.register(first.clone());
        assert!(broker.has_work());
        let (owner, w) = broker.acquire("a").unwrap();
        assert_eq!(owner.name(), "shot");
        assert!(!broker.has_work());
        assert!(broker.acquire("b").is_none());
        assert_eq!(broker.workload_lost("shot", &w.name), 50);
        assert!(broker.has_work());
        broker.unregister("shot");
        assert!(!broker.has_work());
    }
}
