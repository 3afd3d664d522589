// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Supervisor
//!
//! One [`AgentWorker`] per pool slot. Its identity survives re-creation of
//! the backing instance; only the address changes.
//!
//! ## Agent State Machine
//! | Observation | State |
//! |-------------|-------|
//! | provider knows no instance | `DESTROYED` |
//! | instance powered off | `STOPPED` |
//! | instance powered on | `STARTED` |
//! | `GET status` answered | `ACTIVE` |
//!
//! ## Actors
//! - **state watcher** (5 s): runs while the state is at least `STARTED`,
//!   exits when it regresses; restarted by [`AgentWorker::activate_state_watcher`]
//! - **work loop** (1 s): pulls workloads, provisions on demand, stops an
//!   instance that has been idle too long
//! - **downloader**: fetches results, renders before previews
//!
//! A worker holding a workload whose agent drops below `STARTED` reports
//! the sub-task lost so its samples return to the parent.

use crate::application::splitter::{SplitJob, WorkloadBroker};
use crate::application::worker_pool::WorkerPool;
use crate::domain::agent::{AgentApi, AgentApiError, AgentState, NodeStatus};
use crate::domain::blob::{BlobId, ResultKind};
use crate::domain::node_config::PoolConfig;
use crate::domain::provider::{BootstrapFile, InstancePower, ResourceProvider};
use crate::domain::workload::Workload;
use crate::infrastructure::blob_cache::BlobCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub state_poll: Duration,
    pub work_poll: Duration,
    pub idle_timeout: Duration,
    pub upload_concurrency: usize,
    pub upload_retries: u32,
    pub retry_delay: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            state_poll: Duration::from_secs(5),
            work_poll: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(300),
            upload_concurrency: 4,
            upload_retries: 5,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl From<&PoolConfig> for SupervisorSettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            state_poll: Duration::from_secs(config.state_poll_seconds),
            work_poll: Duration::from_secs(config.work_poll_seconds),
            idle_timeout: Duration::from_secs(config.idle_timeout_seconds),
            upload_concurrency: config.upload_concurrency,
            upload_retries: config.upload_retries,
            ..Self::default()
        }
    }
}

/// Retry `op` up to `attempts` times, sleeping `delay` in between
pub async fn with_retry<T, F, Fut>(attempts: u32, delay: Duration, mut op: F) -> Result<T, AgentApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AgentApiError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            // The agent answered; repeating the request will not change that
            Err(e @ AgentApiError::Rejected { .. }) | Err(e @ AgentApiError::NotFound(_)) => {
                return Err(e)
            }
            Err(e) if attempt >= attempts.max(1) => return Err(e),
            Err(e) => {
                debug!(attempt, error = %e, "Agent request failed; retrying");
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Sub-task a worker is currently responsible for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignedWorkload {
    pub parent: String,
    pub name: String,
    pub samples: u32,
}

/// `GET agent` entry
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub state: AgentState,
    pub address: Option<String>,
    pub enabled: bool,
    pub workload: Option<AssignedWorkload>,
    pub status: Option<NodeStatus>,
}

pub type DownloadCallback = Box<dyn FnOnce(Option<BlobId>) + Send>;

struct DownloadRequest {
    task: String,
    kind: ResultKind,
    callback: DownloadCallback,
}

#[derive(Default)]
struct DownloadQueues {
    renders: VecDeque<DownloadRequest>,
    /// Only the latest preview per task is worth fetching
    previews: BTreeMap<String, DownloadRequest>,
}

impl DownloadQueues {
    fn pop(&mut self) -> Option<DownloadRequest> {
        self.renders
            .pop_front()
            .or_else(|| self.previews.pop_first().map(|(_, r)| r))
    }
}

pub struct AgentWorker {
    name: String,
    provider: Arc<dyn ResourceProvider>,
    api: Arc<dyn AgentApi>,
    broker: Arc<WorkloadBroker>,
    blobs: Arc<BlobCache>,
    settings: SupervisorSettings,
    bootstrap: Vec<BootstrapFile>,
    state: Mutex<AgentState>,
    address: Mutex<Option<String>>,
    last_status: Mutex<Option<NodeStatus>>,
    current: Mutex<Option<AssignedWorkload>>,
    enabled: AtomicBool,
    watcher_running: AtomicBool,
    idle_since: Mutex<Instant>,
    idle_stop_sent: AtomicBool,
    downloads: Mutex<DownloadQueues>,
    download_ready: Notify,
    shutdown: CancellationToken,
}

impl AgentWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn ResourceProvider>,
        api: Arc<dyn AgentApi>,
        broker: Arc<WorkloadBroker>,
        blobs: Arc<BlobCache>,
        settings: SupervisorSettings,
        bootstrap: Vec<BootstrapFile>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            provider,
            api,
            broker,
            blobs,
            settings,
            bootstrap,
            state: Mutex::new(AgentState::Unknown),
            address: Mutex::new(None),
            last_status: Mutex::new(None),
            current: Mutex::new(None),
            enabled: AtomicBool::new(true),
            watcher_running: AtomicBool::new(false),
            idle_since: Mutex::new(Instant::now()),
            idle_stop_sent: AtomicBool::new(false),
            downloads: Mutex::new(DownloadQueues::default()),
            download_ready: Notify::new(),
            shutdown,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn api(&self) -> &Arc<dyn AgentApi> {
        &self.api
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock()
    }

    pub fn address(&self) -> Option<String> {
        self.address.lock().clone()
    }

    pub fn busy(&self) -> bool {
        self.current.lock().is_some()
    }

    pub fn current_workload(&self) -> Option<AssignedWorkload> {
        self.current.lock().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            state: self.state(),
            address: self.address(),
            enabled: self.is_enabled(),
            workload: self.current_workload(),
            status: self.last_status.lock().clone(),
        }
    }

    /// Start the work loop and the downloader
    pub fn spawn(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(self).work_loop()),
            tokio::spawn(Arc::clone(self).download_loop()),
        ]
    }

    // ------------------------------------------------------------------
    // State tracking
    // ------------------------------------------------------------------

    fn set_state(&self, next: AgentState) {
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        if previous == next {
            return;
        }
        info!(agent = %self.name, from = %previous, to = %next, "Agent state changed");

        if next < AgentState::Started {
            let lost = self.current.lock().take();
            if let Some(workload) = lost {
                let released = self.broker.workload_lost(&workload.parent, &workload.name);
                warn!(
                    agent = %self.name,
                    subtask = %workload.name,
                    released,
                    "Agent went away with a sub-task in flight"
                );
                *self.idle_since.lock() = Instant::now();
            }
        }
    }

    /// One observation of the instance; updates and returns the state
    pub async fn poll_state(&self) -> AgentState {
        let info = match self.provider.describe_agent_instance(&self.name).await {
            Ok(info) => info,
            Err(e) => {
                warn!(agent = %self.name, error = %e, "Failed to describe agent instance");
                return self.state();
            }
        };
        if info.address.is_some() {
            *self.address.lock() = info.address.clone();
        }

        let next = match info.power {
            InstancePower::Missing => AgentState::Destroyed,
            InstancePower::Stopped => AgentState::Stopped,
            InstancePower::Running => match info.address.as_deref() {
                Some(address) => match self.api.status(address).await {
                    Ok(status) => {
                        *self.last_status.lock() = Some(status);
                        AgentState::Active
                    }
                    Err(e) => {
                        debug!(agent = %self.name, error = %e, "Agent status not available yet");
                        AgentState::Started
                    }
                },
                None => AgentState::Started,
            },
        };
        self.set_state(next);
        next
    }

    /// Make sure the 5 s state watcher is running
    pub fn activate_state_watcher(self: &Arc<Self>) {
        if self.watcher_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            debug!(agent = %worker.name, "State watcher started");
            loop {
                if worker.poll_state().await < AgentState::Started {
                    break;
                }
                tokio::select! {
                    _ = worker.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(worker.settings.state_poll) => {}
                }
            }
            worker.watcher_running.store(false, Ordering::SeqCst);
            debug!(agent = %worker.name, state = %worker.state(), "State watcher exited");
        });
    }

    /// Bring the agent up and wait until it is `ACTIVE`
    ///
    /// Returns `false` when the worker was disabled or shut down first.
    pub async fn wait_agent(self: &Arc<Self>) -> bool {
        let mut start_requested = false;
        loop {
            if !self.is_enabled() || self.shutdown.is_cancelled() {
                return false;
            }
            match self.poll_state().await {
                AgentState::Active => {
                    self.activate_state_watcher();
                    return true;
                }
                AgentState::Started => self.activate_state_watcher(),
                AgentState::Stopped | AgentState::Destroyed if !start_requested => {
                    start_requested = self.start_agent().await;
                }
                _ => {}
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.settings.state_poll) => {}
            }
        }
    }

    /// Power on a stopped instance, or create a destroyed one after
    /// uploading its bootstrap files
    pub async fn start_agent(&self) -> bool {
        let result = match self.state() {
            AgentState::Stopped => {
                info!(agent = %self.name, "Starting agent instance");
                self.provider.start_agent_instance(&self.name).await
            }
            AgentState::Destroyed => {
                if let Err(e) = self.upload_bootstrap().await {
                    error!(agent = %self.name, error = %e, "Bootstrap upload failed");
                    return false;
                }
                info!(agent = %self.name, "Creating agent instance");
                self.provider.create_agent_instance(&self.name).await
            }
            _ => return true,
        };
        match result {
            Ok(()) => {
                self.idle_stop_sent.store(false, Ordering::SeqCst);
                *self.idle_since.lock() = Instant::now();
                true
            }
            Err(e) => {
                warn!(agent = %self.name, error = %e, "Failed to start agent instance");
                false
            }
        }
    }

    async fn upload_bootstrap(&self) -> Result<(), String> {
        let pool: WorkerPool<String> = WorkerPool::new(
            format!("bootstrap-{}", self.name),
            self.settings.upload_concurrency,
        );
        pool.add_set(self.bootstrap.iter().cloned().map(|file| {
            let provider = self.provider.clone();
            let agent = self.name.clone();
            async move {
                let name = file.name.clone();
                provider
                    .upload_bootstrap_file(&agent, file)
                    .await
                    .map_err(|e| format!("{}: {}", name, e))
            }
        }));
        if pool.wait().await {
            return Err(pool.take_failures().join("; "));
        }
        Ok(())
    }

    pub async fn seconds_until_termination(&self) -> Option<u64> {
        self.provider.seconds_until_termination(&self.name).await
    }

    pub async fn is_preemption_imminent(&self) -> bool {
        self.provider.is_preemption_imminent(&self.name).await
    }

    /// Forget the current workload; the sub-task was wound up elsewhere
    pub fn release_workload(&self, name: &str) {
        let mut current = self.current.lock();
        if current.as_ref().map(|w| w.name.as_str()) == Some(name) {
            *current = None;
            *self.idle_since.lock() = Instant::now();
            debug!(agent = %self.name, subtask = %name, "Worker freed");
        }
    }

    pub async fn stop_instance(&self) {
        if let Err(e) = self.provider.stop_agent_instance(&self.name).await {
            debug!(agent = %self.name, error = %e, "Stop request not honoured");
        }
    }

    pub async fn delete_instance(&self) {
        if let Err(e) = self.provider.delete_agent_instance(&self.name).await {
            debug!(agent = %self.name, error = %e, "Delete request not honoured");
        }
    }

    // ------------------------------------------------------------------
    // Work loop
    // ------------------------------------------------------------------

    async fn work_loop(self: Arc<Self>) {
        debug!(agent = %self.name, "Work loop started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.work_poll) => {}
            }
            self.work_tick().await;
        }
        debug!(agent = %self.name, "Work loop stopped");
    }

    /// One iteration of the work loop
    pub async fn work_tick(self: &Arc<Self>) {
        if !self.is_enabled() {
            return;
        }
        if self.busy() {
            *self.idle_since.lock() = Instant::now();
            return;
        }

        if self.broker.has_work() {
            if self.state() != AgentState::Active && !self.wait_agent().await {
                return;
            }
            if let Some((job, workload)) = self.broker.acquire(&self.name) {
                self.dispatch(job, workload).await;
            }
            return;
        }

        let idle_for = self.idle_since.lock().elapsed();
        if idle_for > self.settings.idle_timeout
            && self.state() >= AgentState::Started
            && !self.idle_stop_sent.swap(true, Ordering::SeqCst)
        {
            info!(agent = %self.name, idle_seconds = idle_for.as_secs(), "Stopping idle agent");
            self.stop_instance().await;
        }
    }

    async fn dispatch(self: &Arc<Self>, job: Arc<SplitJob>, workload: Workload) {
        *self.current.lock() = Some(AssignedWorkload {
            parent: workload.parent.clone(),
            name: workload.name.clone(),
            samples: workload.samples(),
        });
        self.idle_stop_sent.store(false, Ordering::SeqCst);

        if let Err(e) = self.push_workload(&workload).await {
            warn!(agent = %self.name, subtask = %workload.name, error = %e, "Failed to hand workload to agent");
            job.workload_failed(&workload.name);
            self.release_workload(&workload.name);
        }
    }

    async fn push_workload(&self, workload: &Workload) -> Result<(), String> {
        let address = self.address().ok_or("agent has no address")?;
        let attempts = self.settings.upload_retries;
        let delay = self.settings.retry_delay;

        let missing = with_retry(attempts, delay, || self.api.task_create(&address, workload))
            .await
            .map_err(|e| e.to_string())?;

        if !missing.is_empty() {
            info!(agent = %self.name, subtask = %workload.name, files = missing.len(), "Uploading dependencies");
            let pool: WorkerPool<String> = WorkerPool::new(
                format!("upload-{}", self.name),
                self.settings.upload_concurrency,
            );
            for path in missing {
                let Some(id) = workload.files.get(&path).cloned() else {
                    return Err(format!("agent asked for unknown file {}", path));
                };
                let (source, size) = match (self.blobs.blob_path(&id), self.blobs.get(&id)) {
                    (Some(source), Some(meta)) => (source, meta.size),
                    _ => return Err(format!("{}: blob {} is no longer cached", path, id)),
                };
                let api = self.api.clone();
                let address = address.clone();
                let task = workload.name.clone();
                pool.add(async move {
                    with_retry(attempts, delay, || {
                        api.upload_file(&address, &task, &path, &id, &source, size)
                    })
                    .await
                    .map_err(|e| format!("{}: {}", path, e))
                });
            }
            if pool.wait().await {
                return Err(pool.take_failures().join("; "));
            }
        }

        with_retry(attempts, delay, || self.api.task_run(&address, &workload.name))
            .await
            .map_err(|e| e.to_string())?;
        info!(agent = %self.name, subtask = %workload.name, "Sub-task started on agent");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Downloader
    // ------------------------------------------------------------------

    /// Queue a result download; `callback` receives the cached blob id or
    /// `None` when the download failed
    pub fn queue_download(&self, task: &str, kind: ResultKind, callback: DownloadCallback) {
        let request = DownloadRequest {
            task: task.to_string(),
            kind,
            callback,
        };
        {
            let mut queues = self.downloads.lock();
            match kind {
                ResultKind::Render => queues.renders.push_back(request),
                ResultKind::Preview => {
                    queues.previews.insert(task.to_string(), request);
                }
            }
        }
        self.download_ready.notify_one();
    }

    pub fn queued_downloads(&self) -> usize {
        let queues = self.downloads.lock();
        queues.renders.len() + queues.previews.len()
    }

    async fn download_loop(self: Arc<Self>) {
        loop {
            let next = self.downloads.lock().pop();
            match next {
                Some(request) => {
                    let result = self.download(&request.task, request.kind).await;
                    (request.callback)(result);
                }
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.download_ready.notified() => {}
                    }
                }
            }
        }
    }

    /// Fetch one artifact into the blob cache
    pub async fn download(&self, task: &str, kind: ResultKind) -> Option<BlobId> {
        let address = self.address()?;
        let download = match self.api.download_result(&address, task, kind).await {
            Ok(download) => download,
            Err(e) => {
                warn!(agent = %self.name, subtask = %task, kind = %kind, error = %e, "Result download failed");
                return None;
            }
        };
        if self.blobs.contains(&download.id) {
            debug!(agent = %self.name, blob = %download.id, "Result already cached");
            return Some(download.id);
        }
        match self
            .blobs
            .store_stream(download.stream, Some(&download.id), Some(download.size))
            .await
        {
            Ok(meta) => {
                debug!(agent = %self.name, subtask = %task, kind = %kind, blob = %meta.id, size = meta.size, "Result downloaded");
                Some(meta.id)
            }
            Err(e) => {
                warn!(agent = %self.name, subtask = %task, kind = %kind, error = %e, "Failed to store result");
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::application::task_handle::TaskHandle;
    use crate::domain::agent::ResultDownload;
    use crate::domain::provider::{InstanceInfo, ProviderError};
    use crate::domain::task::{Task, TaskKind, TaskStatusView};
    use crate::infrastructure::repositories::InMemoryTaskRepository;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;

    #[derive(Default)]
    pub(crate) struct ProviderLog {
        pub power: Option<InstancePower>,
        pub starts: u32,
        pub creates: u32,
        pub stops: u32,
        pub bootstrap: Vec<String>,
    }

    pub(crate) struct MockProvider {
        pub log: Mutex<ProviderLog>,
    }

    impl MockProvider {
        pub fn new(power: InstancePower) -> Arc<Self> {
            Arc::new(Self {
                log: Mutex::new(ProviderLog {
                    power: Some(power),
                    ..Default::default()
                }),
            })
        }
    }

    #[async_trait]
    impl ResourceProvider for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        async fn describe_agent_instance(&self, _agent: &str) -> Result<InstanceInfo, ProviderError> {
            let power = self.log.lock().power.unwrap_or(InstancePower::Missing);
            Ok(InstanceInfo {
                power,
                address: (power == InstancePower::Running).then(|| "10.0.0.2:8443".to_string()),
            })
        }

        async fn start_agent_instance(&self, _agent: &str) -> Result<(), ProviderError> {
            let mut log = self.log.lock();
            log.starts += 1;
            log.power = Some(InstancePower::Running);
            Ok(())
        }

        async fn create_agent_instance(&self, _agent: &str) -> Result<(), ProviderError> {
            let mut log = self.log.lock();
            log.creates += 1;
            log.power = Some(InstancePower::Running);
            Ok(())
        }

        async fn stop_agent_instance(&self, _agent: &str) -> Result<(), ProviderError> {
            let mut log = self.log.lock();
            log.stops += 1;
            log.power = Some(InstancePower::Stopped);
            Ok(())
        }

        async fn delete_agent_instance(&self, _agent: &str) -> Result<(), ProviderError> {
            self.log.lock().power = Some(InstancePower::Missing);
            Ok(())
        }

        async fn upload_bootstrap_file(&self, _agent: &str, file: BootstrapFile) -> Result<(), ProviderError> {
            self.log.lock().bootstrap.push(file.name);
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct ApiLog {
        pub created: Vec<Workload>,
        pub uploads: Vec<String>,
        pub runs: Vec<String>,
        pub missing: Vec<String>,
        pub fail_create: bool,
        pub artifacts: BTreeMap<String, Vec<u8>>,
    }

    #[derive(Default)]
    pub(crate) struct MockApi {
        pub log: Mutex<ApiLog>,
    }

    #[async_trait]
    impl AgentApi for MockApi {
        async fn status(&self, _address: &str) -> Result<NodeStatus, AgentApiError> {
            Ok(NodeStatus::default())
        }

        async fn task_create(&self, _address: &str, workload: &Workload) -> Result<Vec<String>, AgentApiError> {
            let mut log = self.log.lock();
            if log.fail_create {
                return Err(AgentApiError::Unreachable("connection refused".to_string()));
            }
            log.created.push(workload.clone());
            Ok(log.missing.clone())
        }

        async fn upload_file(
            &self,
            _address: &str,
            _task: &str,
            path: &str,
            _id: &BlobId,
            source: &Path,
            size: u64,
        ) -> Result<(), AgentApiError> {
            assert_eq!(std::fs::metadata(source)?.len(), size);
            self.log.lock().uploads.push(path.to_string());
            Ok(())
        }

        async fn task_run(&self, _address: &str, task: &str) -> Result<(), AgentApiError> {
            self.log.lock().runs.push(task.to_string());
            Ok(())
        }

        async fn task_stop(&self, _address: &str, _task: &str) -> Result<(), AgentApiError> {
            Ok(())
        }

        async fn task_remove(&self, _address: &str, _task: &str) -> Result<(), AgentApiError> {
            Ok(())
        }

        async fn task_status(&self, _address: &str, task: &str) -> Result<TaskStatusView, AgentApiError> {
            Err(AgentApiError::NotFound(task.to_string()))
        }

        async fn task_details(&self, _address: &str, _task: &str) -> Result<serde_json::Value, AgentApiError> {
            Ok(json!({}))
        }

        async fn task_messages(&self, _address: &str, _task: &str) -> Result<serde_json::Value, AgentApiError> {
            Ok(json!({}))
        }

        async fn download_result(
            &self,
            _address: &str,
            task: &str,
            kind: ResultKind,
        ) -> Result<ResultDownload, AgentApiError> {
            let key = format!("{}/{}", task, kind);
            let data = self
                .log
                .lock()
                .artifacts
                .get(&key)
                .cloned()
                .ok_or_else(|| AgentApiError::NotFound(key))?;
            Ok(ResultDownload {
                id: BlobId::digest(&data),
                size: data.len() as u64,
                stream: futures::stream::iter(vec![Ok(Bytes::from(data))]).boxed(),
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        blobs: Arc<BlobCache>,
        broker: Arc<WorkloadBroker>,
        provider: Arc<MockProvider>,
        api: Arc<MockApi>,
        worker: Arc<AgentWorker>,
    }

    fn fixture(power: InstancePower) -> Fixture {
        let dir = TempDir::new().unwrap();
        let blobs = Arc::new(BlobCache::open(dir.path(), None).unwrap());
        let broker = Arc::new(WorkloadBroker::new());
        let provider = MockProvider::new(power);
        let api = Arc::new(MockApi::default());
        let settings = SupervisorSettings {
            retry_delay: Duration::from_millis(1),
            upload_retries: 2,
            ..SupervisorSettings::default()
        };
        let worker = AgentWorker::new(
            "ws-01",
            provider.clone(),
            api.clone(),
            broker.clone(),
            blobs.clone(),
            settings,
            vec![
                BootstrapFile {
                    name: "config.yaml".to_string(),
                    content: b"kind: NodeConfig".to_vec(),
                },
                BootstrapFile {
                    name: "ca.pem".to_string(),
                    content: Vec::new(),
                },
            ],
            CancellationToken::new(),
        );
        Fixture {
            _dir: dir,
            blobs,
            broker,
            provider,
            api,
            worker,
        }
    }

    async fn split_job(f: &Fixture, samples: u32) -> Arc<SplitJob> {
        let scene = f.blobs.store_bytes(Bytes::from_static(b"scene")).await.unwrap();
        let mut task = Task::new("shot", TaskKind::Manager).unwrap();
        task.set_config(
            json!({"project": "shot.blend", "samples": samples})
                .as_object()
                .unwrap(),
        )
        .unwrap();
        task.set_file("shot.blend", scene.id).unwrap();
        let job = SplitJob::new(TaskHandle::new(task, Arc::new(InMemoryTaskRepository::new())));
        f.broker.register(job.clone());
        job
    }

    #[tokio::test]
    async fn test_state_mapping() {
        let f = fixture(InstancePower::Missing);
        assert_eq!(f.worker.state(), AgentState::Unknown);
        assert_eq!(f.worker.poll_state().await, AgentState::Destroyed);
        f.provider.log.lock().power = Some(InstancePower::Stopped);
        assert_eq!(f.worker.poll_state().await, AgentState::Stopped);
        f.provider.log.lock().power = Some(InstancePower::Running);
        assert_eq!(f.worker.poll_state().await, AgentState::Active);
        assert_eq!(f.worker.address().as_deref(), Some("10.0.0.2:8443"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_agent_is_stopped_exactly_once() {
        let f = fixture(InstancePower::Running);
        f.worker.poll_state().await;
        let handles = f.worker.spawn();

        tokio::time::sleep(Duration::from_secs(301)).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.provider.log.lock().stops, 1);

        // still idle, instance back up: no second request in the same idle period
        f.provider.log.lock().power = Some(InstancePower::Running);
        f.worker.poll_state().await;
        tokio::time::sleep(Duration::from_secs(400)).await;
        assert_eq!(f.provider.log.lock().stops, 1);

        f.worker.shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_destroyed_agent_is_bootstrapped_and_created() {
        let f = fixture(InstancePower::Missing);
        f.worker.poll_state().await;
        assert!(f.worker.start_agent().await);
        let log = f.provider.log.lock();
        assert_eq!(log.creates, 1);
        let mut uploaded = log.bootstrap.clone();
        uploaded.sort();
        assert_eq!(uploaded, vec!["ca.pem", "config.yaml"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_work_tick_provisions_and_dispatches() {
        let f = fixture(InstancePower::Stopped);
        let job = split_job(&f, 50).await;
        f.api.log.lock().missing = vec!["shot.blend".to_string()];

        f.worker.work_tick().await;
        assert_eq!(f.provider.log.lock().starts, 1);
        assert_eq!(f.worker.state(), AgentState::Active);

        let log = f.api.log.lock();
        assert_eq!(log.created.len(), 1);
        assert_eq!(log.created[0].name, "shot_0");
        assert_eq!(log.uploads, vec!["shot.blend".to_string()]);
        assert_eq!(log.runs, vec!["shot_0".to_string()]);
        drop(log);

        assert!(f.worker.busy());
        assert_eq!(job.samples_available(), 0);
        f.worker.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_failed_dispatch_returns_samples() {
        let f = fixture(InstancePower::Running);
        let job = split_job(&f, 50).await;
        f.api.log.lock().fail_create = true;
        f.worker.poll_state().await;

        f.worker.work_tick().await;
        assert!(!f.worker.busy());
        assert_eq!(job.samples_available(), 50);
        assert!(job.subtask("shot_0").unwrap().failed);
    }

    #[tokio::test]
    async fn test_lost_agent_returns_workload() {
        let f = fixture(InstancePower::Running);
        let job = split_job(&f, 50).await;
        f.worker.poll_state().await;
        f.worker.work_tick().await;
        assert!(f.worker.busy());

        f.provider.log.lock().power = Some(InstancePower::Missing);
        assert_eq!(f.worker.poll_state().await, AgentState::Destroyed);
        assert!(!f.worker.busy());
        assert_eq!(job.samples_available(), 50);
    }

    #[tokio::test]
    async fn test_downloads_prefer_renders_and_dedupe_previews() {
        let f = fixture(InstancePower::Running);
        f.worker.poll_state().await;
        {
            let mut log = f.api.log.lock();
            log.artifacts.insert("t_0/render".to_string(), b"render".to_vec());
            log.artifacts.insert("t_0/preview".to_string(), b"preview-2".to_vec());
        }

        let order = Arc::new(Mutex::new(Vec::new()));
        let record = |label: &'static str| -> DownloadCallback {
            let order = order.clone();
            Box::new(move |id| order.lock().push((label, id)))
        };
        f.worker.queue_download("t_0", ResultKind::Preview, record("preview-1"));
        f.worker.queue_download("t_0", ResultKind::Preview, record("preview-2"));
        f.worker.queue_download("t_0", ResultKind::Render, record("render"));
        f.worker.queue_download("t_1", ResultKind::Render, record("missing"));
        assert_eq!(f.worker.queued_downloads(), 3);

        let handles = f.worker.spawn();
        for _ in 0..200 {
            if order.lock().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let order = order.lock().clone();
        assert_eq!(
            order,
            vec![
                ("render", Some(BlobId::digest(b"render"))),
                ("missing", None),
                ("preview-2", Some(BlobId::digest(b"preview-2"))),
            ]
        );
        assert!(f.blobs.contains(&BlobId::digest(b"render")));

        f.worker.shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_attempts() {
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = with_retry(3, Duration::from_millis(1), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AgentApiError::Unreachable("down".to_string()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let rejected: Result<(), _> = with_retry(3, Duration::from_millis(1), || async {
            Err(AgentApiError::Rejected {
                status: 409,
                message: "busy".to_string(),
            })
        })
        .await;
        assert!(matches!(rejected, Err(AgentApiError::Rejected { .. })));
    }
}
