// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Asynchronous blob deletion
//!
//! Result bookkeeping (merges, preview replacement) runs on hot loops that
//! must not block on cache I/O, so superseded blobs are handed to a
//! background task instead of being removed inline.

use crate::domain::blob::{BlobError, BlobId};
use crate::infrastructure::blob_cache::BlobCache;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct BlobReaper {
    tx: mpsc::UnboundedSender<BlobId>,
}

impl BlobReaper {
    /// Reaper with a detached receiver, for callers that drain it themselves
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BlobId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Reaper backed by a task deleting from `cache`
    ///
    /// The task exits once every `BlobReaper` clone is dropped.
    pub fn spawn(cache: Arc<BlobCache>) -> (Self, tokio::task::JoinHandle<()>) {
        let (reaper, rx) = Self::channel();
        let handle = tokio::spawn(Self::run(rx, cache));
        (reaper, handle)
    }

    async fn run(mut rx: mpsc::UnboundedReceiver<BlobId>, cache: Arc<BlobCache>) {
        while let Some(id) = rx.recv().await {
            match cache.remove(&id).await {
                Ok(true) => debug!(blob = %id, "Reaped superseded blob"),
                Ok(false) => {}
                Err(BlobError::Pinned(_)) => {
                    debug!(blob = %id, "Superseded blob is still linked; keeping it")
                }
                Err(e) => warn!(blob = %id, error = %e, "Failed to reap blob"),
            }
        }
    }

    pub fn reap(&self, id: BlobId) {
        if self.tx.send(id).is_err() {
            warn!("Blob reaper is not running");
        }
    }
}
