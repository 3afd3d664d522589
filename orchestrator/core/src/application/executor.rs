// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Task Executor
//!
//! Owns every task of a process and runs at most one of them at a time.
//!
//! ## Collections
//! | Collection | Contents |
//! |------------|----------|
//! | task map | every known task, the single source of task identity |
//! | pending queue | FIFO of task names waiting for the execution slot |
//! | running set | at most one in-flight execution |
//!
//! A background tick promotes the head of the pending queue once the
//! running set is empty. What "executing" means is delegated to a
//! [`TaskStrategy`]: agents run the renderer, managers distribute workloads.

use crate::application::task_handle::TaskHandle;
use crate::domain::blob::BlobId;
use crate::domain::repository::{RepositoryError, TaskRepository};
use crate::domain::task::{Task, TaskError, TaskKind, TaskState, TaskSummary};
use crate::domain::task_config::TaskConfig;
use crate::infrastructure::blob_cache::BlobCache;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// How an execution ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Stopped,
    Failed(String),
}

/// Execution behaviour plugged into the shared task state machine
#[async_trait]
pub trait TaskStrategy: Send + Sync {
    fn kind(&self) -> TaskKind;

    /// Drive a RUNNING task until it ends; `cancel` fires on `stop()`
    async fn execute(&self, task: Arc<TaskHandle>, cancel: CancellationToken) -> TaskOutcome;

    /// Fire-and-forget release of remote resources at shutdown
    fn release(&self) {}
}

pub struct TaskExecutor {
    tasks: RwLock<BTreeMap<String, Arc<TaskHandle>>>,
    pending: Mutex<VecDeque<String>>,
    running: Mutex<HashMap<String, JoinHandle<()>>>,
    strategy: Arc<dyn TaskStrategy>,
    repo: Arc<dyn TaskRepository>,
    blobs: Arc<BlobCache>,
    tick: Duration,
    terminating: AtomicBool,
}

impl TaskExecutor {
    pub fn new(
        strategy: Arc<dyn TaskStrategy>,
        repo: Arc<dyn TaskRepository>,
        blobs: Arc<BlobCache>,
    ) -> Self {
        Self {
            tasks: RwLock::new(BTreeMap::new()),
            pending: Mutex::new(VecDeque::new()),
            running: Mutex::new(HashMap::new()),
            strategy,
            repo,
            blobs,
            tick: DEFAULT_TICK,
            terminating: AtomicBool::new(false),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn kind(&self) -> TaskKind {
        self.strategy.kind()
    }

    pub fn blobs(&self) -> &Arc<BlobCache> {
        &self.blobs
    }

    /// Rebuild in-memory state from persisted snapshots
    ///
    /// Pending tasks are re-queued in creation order; nothing resumes
    /// executing on its own.
    pub async fn load(&self) -> Result<usize, RepositoryError> {
        let mut snapshots = self.repo.load_all().await?;
        snapshots.sort_by_key(|t| t.created_at);
        let count = snapshots.len();

        for snapshot in snapshots {
            let was_running = snapshot.state() == TaskState::Running;
            let task = Task::restore(snapshot);
            let name = task.name.clone();
            let pending = task.state() == TaskState::Pending;
            let handle = TaskHandle::new(task, self.repo.clone());
            if was_running {
                handle.persist().await;
            }
            self.tasks.write().insert(name.clone(), handle.clone());

            if pending {
                let verdict = handle
                    .try_update(|t| t.check(self.blobs.as_ref()))
                    .await;
                match verdict {
                    Ok(()) => self.pending.lock().push_back(name),
                    Err(e) => warn!(task = %name, error = %e, "Restored pending task failed integrity check"),
                }
            }
        }

        info!(tasks = count, pending = self.pending.lock().len(), "Loaded persisted tasks");
        Ok(count)
    }

    /// Background promotion loop
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(executor.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => executor.tick().await,
                }
            }
            debug!("Executor loop stopped");
        })
    }

    /// Sweep ended executions and promote the pending head if the slot is free
    pub async fn tick(&self) {
        self.running.lock().retain(|_, handle| !handle.is_finished());
        if !self.running.lock().is_empty() || self.terminating.load(Ordering::SeqCst) {
            return;
        }

        loop {
            let Some(name) = self.pending.lock().pop_front() else {
                return;
            };
            let Some(handle) = self.tasks.read().get(&name).cloned() else {
                continue;
            };

            // Fresh token before RUNNING is visible so an early stop is kept
            let token = handle.reset_cancel();
            let promoted = handle
                .try_update(|t| {
                    t.check(self.blobs.as_ref())?;
                    t.mark_running()
                })
                .await;
            match promoted {
                Ok(()) => {
                    self.start(handle, token);
                    return;
                }
                Err(e) => warn!(task = %name, error = %e, "Task could not be promoted"),
            }
        }
    }

    fn start(&self, handle: Arc<TaskHandle>, token: CancellationToken) {
        let name = handle.name().to_string();
        let strategy = self.strategy.clone();
        info!(task = %name, "Task started");

        let join = tokio::spawn(async move {
            let outcome = strategy.execute(handle.clone(), token).await;
            let result = handle
                .try_update(|t| match &outcome {
                    TaskOutcome::Completed => t.state_complete(),
                    TaskOutcome::Stopped => t.state_stop(),
                    TaskOutcome::Failed(info) => t.state_error(info.clone()),
                })
                .await;
            match (&outcome, result) {
                (_, Err(e)) => error!(task = %handle.name(), error = %e, "Failed to record task outcome"),
                (TaskOutcome::Failed(info), Ok(())) => {
                    warn!(task = %handle.name(), reason = %info, "Task failed")
                }
                (outcome, Ok(())) => info!(task = %handle.name(), outcome = ?outcome, "Task ended"),
            }
        });
        self.running.lock().insert(name, join);
    }

    pub fn task(&self, name: &str) -> Result<Arc<TaskHandle>, TaskError> {
        self.tasks
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(name.to_string()))
    }

    pub fn task_get(&self, name: &str) -> Result<Task, TaskError> {
        Ok(self.task(name)?.snapshot())
    }

    pub fn task_list(&self) -> BTreeMap<String, TaskSummary> {
        self.tasks
            .read()
            .iter()
            .map(|(name, handle)| (name.clone(), handle.read(|t| t.summary())))
            .collect()
    }

    /// Create a task (or replace a never-run one) and report which files
    /// still have to be uploaded
    pub async fn task_create(
        &self,
        name: &str,
        config: &serde_json::Map<String, serde_json::Value>,
        files: &BTreeMap<String, BlobId>,
    ) -> Result<Vec<String>, TaskError> {
        let mut task = Task::new(name, self.strategy.kind())?;
        task.set_config(config)?;
        for (path, id) in files {
            task.set_file(path, id.clone())?;
        }
        let missing = task.missing_files(self.blobs.as_ref());

        let existing = self.tasks.read().get(name).cloned();
        match existing {
            Some(handle) if handle.state() == TaskState::Created => {
                handle.update(|t| *t = task).await;
                debug!(task = %name, "Replaced unstarted task");
            }
            Some(_) => return Err(TaskError::AlreadyExists(name.to_string())),
            None => {
                let handle = TaskHandle::new(task, self.repo.clone());
                handle.persist().await;
                self.tasks.write().insert(name.to_string(), handle);
                info!(task = %name, missing = missing.len(), "Task created");
            }
        }
        Ok(missing)
    }

    pub async fn task_set_config(
        &self,
        name: &str,
        values: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<TaskConfig, TaskError> {
        let handle = self.task(name)?;
        handle.try_update(|t| t.set_config(values)).await?;
        Ok(handle.read(|t| t.config()))
    }

    pub async fn task_set_file(&self, name: &str, path: &str, id: BlobId) -> Result<(), TaskError> {
        let handle = self.task(name)?;
        handle.try_update(|t| t.set_file(path, id)).await
    }

    /// Queue a task for execution; a no-op for tasks already queued or running
    pub async fn task_run(&self, name: &str) -> Result<(), TaskError> {
        let handle = self.task(name)?;
        match handle.state() {
            TaskState::Pending | TaskState::Running => Ok(()),
            _ => self.task_add_to_pending(&handle).await,
        }
    }

    async fn task_add_to_pending(&self, handle: &Arc<TaskHandle>) -> Result<(), TaskError> {
        handle
            .try_update(|t| {
                t.check(self.blobs.as_ref())?;
                t.mark_pending()
            })
            .await?;
        let mut pending = self.pending.lock();
        if !pending.iter().any(|n| n == handle.name()) {
            pending.push_back(handle.name().to_string());
        }
        info!(task = %handle.name(), position = pending.len(), "Task queued");
        Ok(())
    }

    fn task_remove_from_pending(&self, name: &str) -> bool {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|n| n != name);
        pending.len() != before
    }

    /// Cooperative, idempotent stop
    pub async fn task_stop(&self, name: &str) -> Result<(), TaskError> {
        let handle = self.task(name)?;
        match handle.state() {
            TaskState::Pending => {
                self.task_remove_from_pending(name);
                handle.try_update(|t| t.state_stop()).await?;
                info!(task = %name, "Pending task stopped");
            }
            TaskState::Running => {
                handle.request_stop();
                info!(task = %name, "Stop requested");
            }
            _ => {}
        }
        Ok(())
    }

    pub async fn task_remove(&self, name: &str) -> Result<(), TaskError> {
        let handle = self.task(name)?;
        if matches!(handle.state(), TaskState::Pending | TaskState::Running) {
            return Err(TaskError::Busy(name.to_string()));
        }
        self.tasks.write().remove(name);

        match self.repo.delete(name).await {
            Ok(()) | Err(RepositoryError::NotFound(_)) => {}
            Err(e) => return Err(TaskError::Persistence(e.to_string())),
        }

        for id in handle.read(|t| t.protected_blobs()) {
            if let Err(e) = self.blobs.set_dnd(&id, false).await {
                warn!(task = %name, blob = %id, error = %e, "Failed to release render blob");
            }
        }
        info!(task = %name, "Task removed");
        Ok(())
    }

    pub fn running_names(&self) -> Vec<String> {
        self.running
            .lock()
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn pending_names(&self) -> Vec<String> {
        self.pending.lock().iter().cloned().collect()
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    /// Stop running work, persist every task and release remote resources
    ///
    /// Running executions get `grace` to wind down; resource release is
    /// fired without waiting for it.
    pub async fn shutdown(&self, grace: Duration) {
        self.terminating.store(true, Ordering::SeqCst);
        info!("Executor shutting down");

        let handles: Vec<Arc<TaskHandle>> = self.tasks.read().values().cloned().collect();
        for handle in &handles {
            if handle.state() == TaskState::Running {
                handle.request_stop();
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        while !self.running_names().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        for name in self.running_names() {
            warn!(task = %name, "Task did not stop within the shutdown grace period");
        }

        for handle in &handles {
            handle.persist().await;
        }
        self.strategy.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::repositories::InMemoryTaskRepository;
    use bytes::Bytes;
    use serde_json::json;
    use tempfile::TempDir;

    /// Completes immediately unless the project is "block.blend", which
    /// runs until cancelled
    struct ScriptedStrategy;

    #[async_trait]
    impl TaskStrategy for ScriptedStrategy {
        fn kind(&self) -> TaskKind {
            TaskKind::Agent
        }

        async fn execute(&self, task: Arc<TaskHandle>, cancel: CancellationToken) -> TaskOutcome {
            let project = task.read(|t| t.config().project);
            match project.as_str() {
                "block.blend" => {
                    cancel.cancelled().await;
                    TaskOutcome::Stopped
                }
                "fail.blend" => TaskOutcome::Failed("renderer exited with code 3".to_string()),
                _ => {
                    task.modify(|t| t.status.samples_done = t.config().samples);
                    TaskOutcome::Completed
                }
            }
        }
    }

    struct Fixture {
        _dir: TempDir,
        blobs: Arc<BlobCache>,
        repo: Arc<InMemoryTaskRepository>,
        executor: Arc<TaskExecutor>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let blobs = Arc::new(BlobCache::open(dir.path().join("cache"), None).unwrap());
        let repo = Arc::new(InMemoryTaskRepository::new());
        let executor = Arc::new(
            TaskExecutor::new(Arc::new(ScriptedStrategy), repo.clone(), blobs.clone())
                .with_tick(Duration::from_millis(10)),
        );
        Fixture {
            _dir: dir,
            blobs,
            repo,
            executor,
        }
    }

    async fn create(f: &Fixture, name: &str, project: &str) {
        let scene = f.blobs.store_bytes(Bytes::from(project.to_string())).await.unwrap();
        let config = json!({"project": project, "samples": 16});
        let files = BTreeMap::from([(project.to_string(), scene.id)]);
        let missing = f
            .executor
            .task_create(name, config.as_object().unwrap(), &files)
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    /// Parks the first save of a RUNNING snapshot until released
    #[derive(Default)]
    struct GatedRepository {
        inner: InMemoryTaskRepository,
        hold: AtomicBool,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl TaskRepository for GatedRepository {
        async fn save(&self, task: &Task) -> Result<(), RepositoryError> {
            if task.state() == TaskState::Running && self.hold.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.save(task).await
        }

        async fn load_all(&self) -> Result<Vec<Task>, RepositoryError> {
            self.inner.load_all().await
        }

        async fn delete(&self, name: &str) -> Result<(), RepositoryError> {
            self.inner.delete(name).await
        }
    }

    async fn wait_for_state(executor: &TaskExecutor, name: &str, state: TaskState) {
        for _ in 0..200 {
            executor.tick().await;
            if executor.task(name).unwrap().state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "task {} never reached {} (is {})",
            name,
            state,
            executor.task(name).unwrap().state()
        );
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let f = fixture();
        create(&f, "shot", "scene.blend").await;
        f.executor.task_run("shot").await.unwrap();
        assert_eq!(f.executor.task("shot").unwrap().state(), TaskState::Pending);

        wait_for_state(&f.executor, "shot", TaskState::Completed).await;
        let task = f.executor.task_get("shot").unwrap();
        assert_eq!(task.status.samples_done, 16);
        assert_eq!(
            f.repo.snapshot("shot").unwrap().state(),
            TaskState::Completed
        );
    }

    #[tokio::test]
    async fn test_one_task_at_a_time() {
        let f = fixture();
        create(&f, "first", "block.blend").await;
        create(&f, "second", "scene.blend").await;
        f.executor.task_run("first").await.unwrap();
        f.executor.task_run("second").await.unwrap();

        wait_for_state(&f.executor, "first", TaskState::Running).await;
        for _ in 0..5 {
            f.executor.tick().await;
        }
        assert_eq!(f.executor.task("second").unwrap().state(), TaskState::Pending);
        assert_eq!(f.executor.running_names(), vec!["first".to_string()]);

        f.executor.task_stop("first").await.unwrap();
        wait_for_state(&f.executor, "first", TaskState::Stopped).await;
        wait_for_state(&f.executor, "second", TaskState::Completed).await;
    }

    #[tokio::test]
    async fn test_run_on_active_task_is_noop() {
        let f = fixture();
        create(&f, "t", "block.blend").await;
        f.executor.task_run("t").await.unwrap();
        f.executor.task_run("t").await.unwrap();
        assert_eq!(f.executor.pending_names(), vec!["t".to_string()]);

        wait_for_state(&f.executor, "t", TaskState::Running).await;
        f.executor.task_run("t").await.unwrap();
        assert!(f.executor.pending_names().is_empty());
        f.executor.task_stop("t").await.unwrap();
        f.executor.task_stop("t").await.unwrap();
        wait_for_state(&f.executor, "t", TaskState::Stopped).await;
    }

    #[tokio::test]
    async fn test_failed_execution_records_error() {
        let f = fixture();
        create(&f, "t", "fail.blend").await;
        f.executor.task_run("t").await.unwrap();
        wait_for_state(&f.executor, "t", TaskState::Error).await;
        let task = f.executor.task_get("t").unwrap();
        assert!(task.state_error_info()[0].contains("code 3"));
    }

    #[tokio::test]
    async fn test_integrity_failure_blocks_run() {
        let f = fixture();
        let config = json!({"project": "scene.blend"});
        let files = BTreeMap::from([("scene.blend".to_string(), BlobId::digest(b"absent"))]);
        let missing = f
            .executor
            .task_create("t", config.as_object().unwrap(), &files)
            .await
            .unwrap();
        assert_eq!(missing, vec!["scene.blend".to_string()]);

        let err = f.executor.task_run("t").await.unwrap_err();
        assert!(matches!(err, TaskError::Integrity(_)));
        assert_eq!(f.executor.task("t").unwrap().state(), TaskState::Error);
        assert!(f.executor.pending_names().is_empty());
    }

    #[tokio::test]
    async fn test_stop_pending_and_resume() {
        let f = fixture();
        create(&f, "blocker", "block.blend").await;
        create(&f, "queued", "scene.blend").await;
        f.executor.task_run("blocker").await.unwrap();
        wait_for_state(&f.executor, "blocker", TaskState::Running).await;
        f.executor.task_run("queued").await.unwrap();

        f.executor.task_stop("queued").await.unwrap();
        assert_eq!(f.executor.task("queued").unwrap().state(), TaskState::Stopped);
        assert!(f.executor.pending_names().is_empty());

        f.executor.task_run("queued").await.unwrap();
        assert_eq!(f.executor.pending_names(), vec!["queued".to_string()]);
        f.executor.task_stop("blocker").await.unwrap();
        wait_for_state(&f.executor, "queued", TaskState::Completed).await;
    }

    #[tokio::test]
    async fn test_remove_refused_while_active() {
        let f = fixture();
        create(&f, "t", "block.blend").await;
        f.executor.task_run("t").await.unwrap();
        assert!(matches!(
            f.executor.task_remove("t").await,
            Err(TaskError::Busy(_))
        ));
        f.executor.task_stop("t").await.unwrap();
        f.executor.task_remove("t").await.unwrap();
        assert!(matches!(
            f.executor.task("t"),
            Err(TaskError::NotFound(_))
        ));
        assert!(f.repo.snapshot("t").is_none());
    }

    #[tokio::test]
    async fn test_load_restores_and_requeues() {
        let f = fixture();
        let scene = f.blobs.store_bytes(Bytes::from_static(b"scene")).await.unwrap();

        let mut running = Task::new("was-running", TaskKind::Agent).unwrap();
        running
            .set_config(json!({"project": "scene.blend"}).as_object().unwrap())
            .unwrap();
        running.set_file("scene.blend", scene.id.clone()).unwrap();
        let mut pending = running.clone();
        pending.name = "was-pending".to_string();
        running.mark_pending().unwrap();
        running.mark_running().unwrap();
        pending.mark_pending().unwrap();
        f.repo.save(&running).await.unwrap();
        f.repo.save(&pending).await.unwrap();

        assert_eq!(f.executor.load().await.unwrap(), 2);
        assert_eq!(
            f.executor.task("was-running").unwrap().state(),
            TaskState::Stopped
        );
        assert_eq!(
            f.repo.snapshot("was-running").unwrap().state(),
            TaskState::Stopped
        );
        assert_eq!(f.executor.pending_names(), vec!["was-pending".to_string()]);
        assert!(f.executor.running_names().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_task() {
        let f = fixture();
        create(&f, "t", "block.blend").await;
        f.executor.task_run("t").await.unwrap();
        wait_for_state(&f.executor, "t", TaskState::Running).await;

        f.executor.shutdown(Duration::from_secs(2)).await;
        assert!(f.executor.is_terminating());
        assert_eq!(f.executor.task("t").unwrap().state(), TaskState::Stopped);
        assert_eq!(f.repo.snapshot("t").unwrap().state(), TaskState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_while_starting_is_honoured() {
        let dir = TempDir::new().unwrap();
        let blobs = Arc::new(BlobCache::open(dir.path().join("cache"), None).unwrap());
        let repo = Arc::new(GatedRepository::default());
        let executor = Arc::new(
            TaskExecutor::new(Arc::new(ScriptedStrategy), repo.clone(), blobs.clone())
                .with_tick(Duration::from_millis(10)),
        );
        let f = Fixture {
            _dir: dir,
            blobs,
            repo: Arc::new(InMemoryTaskRepository::new()),
            executor: executor.clone(),
        };
        create(&f, "shot", "block.blend").await;
        executor.task_run("shot").await.unwrap();

        repo.hold.store(true, Ordering::SeqCst);
        let starting = tokio::spawn({
            let executor = executor.clone();
            async move { executor.tick().await }
        });
        repo.entered.notified().await;
        assert_eq!(executor.task("shot").unwrap().state(), TaskState::Running);
        executor.task_stop("shot").await.unwrap();
        repo.release.notify_one();
        starting.await.unwrap();

        wait_for_state(&executor, "shot", TaskState::Stopped).await;
    }
}
