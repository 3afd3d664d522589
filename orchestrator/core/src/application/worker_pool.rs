// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Bounded Worker Pool
//!
//! A named pool of at most `workers` tokio tasks draining a shared queue of
//! futures. Workers are started lazily by `add`/`add_set` and exit after an
//! idle window with nothing queued, so an unused pool holds no tasks.
//!
//! Used for per-agent file upload fan-out and bootstrap uploads during
//! provisioning.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Concurrency-limited job execution with failure collection

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error};

pub const DEFAULT_IDLE_WINDOW: Duration = Duration::from_secs(1);

type PoolJob<E> = BoxFuture<'static, Result<(), E>>;

struct PoolState<E> {
    queue: VecDeque<PoolJob<E>>,
    workers: usize,
    in_flight: usize,
}

struct Shared<E> {
    name: String,
    max_workers: usize,
    idle_window: Duration,
    state: Mutex<PoolState<E>>,
    failures: Mutex<Vec<E>>,
    panics: AtomicUsize,
    work_ready: Notify,
    drained: Notify,
}

pub struct WorkerPool<E> {
    shared: Arc<Shared<E>>,
}

impl<E: Send + 'static> WorkerPool<E> {
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        Self::with_idle_window(name, workers, DEFAULT_IDLE_WINDOW)
    }

    pub fn with_idle_window(name: impl Into<String>, workers: usize, idle_window: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                max_workers: workers.max(1),
                idle_window,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    workers: 0,
                    in_flight: 0,
                }),
                failures: Mutex::new(Vec::new()),
                panics: AtomicUsize::new(0),
                work_ready: Notify::new(),
                drained: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn add<F>(&self, job: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.add_set(std::iter::once(job));
    }

    pub fn add_set<I, F>(&self, jobs: I)
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        let to_spawn = {
            let mut state = self.shared.state.lock();
            for job in jobs {
                state.queue.push_back(job.boxed());
            }
            let wanted = state.queue.len().min(self.shared.max_workers);
            let to_spawn = wanted.saturating_sub(state.workers);
            state.workers += to_spawn;
            to_spawn
        };

        for _ in 0..to_spawn {
            tokio::spawn(Self::worker(Arc::clone(&self.shared)));
        }
        if to_spawn > 0 {
            debug!(pool = %self.shared.name, started = to_spawn, "Started pool workers");
        }
        self.shared.work_ready.notify_waiters();
    }

    async fn worker(shared: Arc<Shared<E>>) {
        loop {
            let job = {
                let mut state = shared.state.lock();
                let job = state.queue.pop_front();
                if job.is_some() {
                    state.in_flight += 1;
                }
                job
            };

            match job {
                Some(job) => {
                    match AssertUnwindSafe(job).catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => shared.failures.lock().push(e),
                        Err(_) => {
                            error!(pool = %shared.name, "Pool job panicked");
                            shared.panics.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    let drained = {
                        let mut state = shared.state.lock();
                        state.in_flight -= 1;
                        state.queue.is_empty() && state.in_flight == 0
                    };
                    if drained {
                        shared.drained.notify_waiters();
                    }
                }
                None => {
                    let notified = shared.work_ready.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if !shared.state.lock().queue.is_empty() {
                        continue;
                    }
                    if tokio::time::timeout(shared.idle_window, notified).await.is_err() {
                        let mut state = shared.state.lock();
                        if state.queue.is_empty() {
                            state.workers -= 1;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Wait until the queue is drained and nothing is in flight
    ///
    /// Returns `true` when at least one unit failed since the last
    /// [`take_failures`](Self::take_failures).
    pub async fn wait(&self) -> bool {
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.shared.state.lock();
                if state.queue.is_empty() && state.in_flight == 0 {
                    break;
                }
            }
            notified.await;
        }
        self.has_failures()
    }

    pub fn has_failures(&self) -> bool {
        !self.shared.failures.lock().is_empty() || self.shared.panics.load(Ordering::SeqCst) > 0
    }

    pub fn failures(&self) -> Vec<E>
    where
        E: Clone,
    {
        self.shared.failures.lock().clone()
    }

    pub fn take_failures(&self) -> Vec<E> {
        self.shared.panics.store(0, Ordering::SeqCst);
        std::mem::take(&mut *self.shared.failures.lock())
    }

    pub fn active_workers(&self) -> usize {
        self.shared.state.lock().workers
    }

    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }
}
