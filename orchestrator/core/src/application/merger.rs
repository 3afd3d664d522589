// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Result merging
//!
//! A [`MergeTracker`] follows the contributor set of one result kind of one
//! manager task. Whenever the set changes it produces a new result:
//!
//! | Contributors | Result |
//! |--------------|--------|
//! | none | unchanged |
//! | one | that blob, as is |
//! | several | output of the external [`ResultMerger`] |
//!
//! Merges run in the background; only one per tracker is in flight. A
//! merged blob this tracker produced is handed to the reaper once a newer
//! result replaces it.

use crate::domain::blob::{BlobId, ResultKind};
use crate::domain::merger::{MergeError, ResultMerger};
use crate::infrastructure::blob_cache::BlobCache;
use crate::infrastructure::blob_reaper::BlobReaper;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct MergeState {
    /// Contributor set the current result was built from
    contributors: Vec<BlobId>,
    current: Option<BlobId>,
    /// Whether `current` is a merge output owned by this tracker
    owned: bool,
    in_flight: bool,
}

pub struct MergeTracker {
    task: String,
    kind: ResultKind,
    merger: Arc<dyn ResultMerger>,
    blobs: Arc<BlobCache>,
    reaper: BlobReaper,
    state: Mutex<MergeState>,
}

impl MergeTracker {
    pub fn new(
        task: impl Into<String>,
        kind: ResultKind,
        merger: Arc<dyn ResultMerger>,
        blobs: Arc<BlobCache>,
        reaper: BlobReaper,
    ) -> Arc<Self> {
        Arc::new(Self {
            task: task.into(),
            kind,
            merger,
            blobs,
            reaper,
            state: Mutex::new(MergeState::default()),
        })
    }

    /// Result blob for the latest finished merge
    pub fn current(&self) -> Option<BlobId> {
        self.state.lock().current.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().in_flight
    }

    /// Whether the current result reflects exactly `contributors`
    pub fn is_current(&self, contributors: &[BlobId]) -> bool {
        let state = self.state.lock();
        !state.in_flight && state.contributors == contributors
    }

    /// Feed the latest contributor set; starts a merge when it changed
    pub fn refresh(self: &Arc<Self>, contributors: Vec<BlobId>) {
        {
            let mut state = self.state.lock();
            if state.in_flight || state.contributors == contributors || contributors.is_empty() {
                return;
            }
            if contributors.len() == 1 {
                let single = contributors[0].clone();
                state.contributors = contributors;
                let retired = Self::replace(&mut state, Some(single), false);
                drop(state);
                self.retire(retired);
                debug!(task = %self.task, kind = %self.kind, "Single contributor promoted to result");
                return;
            }
            state.in_flight = true;
        }

        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = tracker.run_merge(&contributors).await;
            let retired = {
                let mut state = tracker.state.lock();
                state.in_flight = false;
                match outcome {
                    Ok(Some((id, owned))) => {
                        state.contributors = contributors;
                        Self::replace(&mut state, Some(id), owned)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        warn!(task = %tracker.task, kind = %tracker.kind, error = %e, "Merge failed");
                        // Retry on the next refresh
                        state.contributors.clear();
                        None
                    }
                }
            };
            tracker.retire(retired);
        });
    }

    /// Swap the current result; returns a superseded blob to reap
    fn replace(state: &mut MergeState, next: Option<BlobId>, owned: bool) -> Option<BlobId> {
        let previous = std::mem::replace(&mut state.current, next);
        let previous_owned = std::mem::replace(&mut state.owned, owned);
        match previous {
            Some(prev) if previous_owned && Some(&prev) != state.current.as_ref() => {
                if state.contributors.contains(&prev) {
                    None
                } else {
                    Some(prev)
                }
            }
            _ => None,
        }
    }

    fn retire(&self, retired: Option<BlobId>) {
        if let Some(id) = retired {
            debug!(task = %self.task, kind = %self.kind, blob = %id, "Queued superseded merge result");
            self.reaper.reap(id);
        }
    }

    /// Returns the result blob and whether it is a fresh merge output
    async fn run_merge(&self, contributors: &[BlobId]) -> Result<Option<(BlobId, bool)>, MergeError> {
        let mut files = BTreeMap::new();
        for (index, id) in contributors.iter().enumerate() {
            if self.blobs.contains(id) {
                files.insert(format!("part_{:04}", index), id.clone());
            } else {
                warn!(task = %self.task, kind = %self.kind, blob = %id, "Merge contributor missing from cache; skipping");
            }
        }
        match files.len() {
            0 => return Ok(None),
            1 => return Ok(files.into_values().next().map(|id| (id, false))),
            _ => {}
        }

        let workspace_name = format!("merge-{}-{}", self.task, self.kind);
        let workspace = self
            .blobs
            .workspace_create(&workspace_name, &files)
            .await
            .map_err(|e| MergeError::Command(e.to_string()))?;
        let blobs = self.blobs.clone();
        let _cleanup = scopeguard::guard(workspace_name, move |name| blobs.workspace_clean(&name));

        let inputs: Vec<PathBuf> = files.keys().map(|k| workspace.join(k)).collect();
        let output = workspace.join(format!("{}.out", self.kind));
        self.merger.merge(&inputs, &output).await?;
        if !output.exists() {
            return Err(MergeError::NoOutput(output));
        }

        let meta = self
            .blobs
            .store_file(&output)
            .await
            .map_err(|e| MergeError::Command(e.to_string()))?;
        if self.kind == ResultKind::Render {
            if let Err(e) = self.blobs.set_dnd(&meta.id, true).await {
                warn!(task = %self.task, error = %e, "Failed to protect merged render");
            }
        }
        info!(
            task = %self.task,
            kind = %self.kind,
            inputs = inputs.len(),
            blob = %meta.id,
            "Merged partial results"
        );
        Ok(Some((meta.id, true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Concatenates inputs in order
    struct ConcatMerger;

    #[async_trait]
    impl ResultMerger for ConcatMerger {
        async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError> {
            let mut out = Vec::new();
            for input in inputs {
                out.extend(tokio::fs::read(input).await?);
            }
            tokio::fs::write(output, out).await?;
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        blobs: Arc<BlobCache>,
        reaped: UnboundedReceiver<BlobId>,
        tracker: Arc<MergeTracker>,
    }

    fn fixture(kind: ResultKind) -> Fixture {
        let dir = TempDir::new().unwrap();
        let blobs = Arc::new(BlobCache::open(dir.path().join("cache"), None).unwrap());
        let (reaper, reaped) = BlobReaper::channel();
        let tracker = MergeTracker::new("shot", kind, Arc::new(ConcatMerger), blobs.clone(), reaper);
        Fixture {
            _dir: dir,
            blobs,
            reaped,
            tracker,
        }
    }

    async fn settle(tracker: &MergeTracker) {
        for _ in 0..200 {
            if !tracker.is_busy() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("merge never finished");
    }

    async fn blob(blobs: &BlobCache, data: &'static [u8]) -> BlobId {
        blobs.store_bytes(Bytes::from_static(data)).await.unwrap().id
    }

    #[tokio::test]
    async fn test_single_contributor_is_result() {
        let f = fixture(ResultKind::Preview);
        let a = blob(&f.blobs, b"a").await;
        f.tracker.refresh(vec![a.clone()]);
        assert_eq!(f.tracker.current(), Some(a.clone()));
        assert!(f.tracker.is_current(&[a]));
    }

    #[tokio::test]
    async fn test_merge_and_supersede() {
        let mut f = fixture(ResultKind::Render);
        let a = blob(&f.blobs, b"a").await;
        let b = blob(&f.blobs, b"b").await;
        let c = blob(&f.blobs, b"c").await;

        f.tracker.refresh(vec![a.clone(), b.clone()]);
        settle(&f.tracker).await;
        let first = f.tracker.current().unwrap();
        assert_eq!(first, BlobId::digest(b"ab"));
        assert!(f.blobs.get(&first).unwrap().dnd);

        // unchanged set: nothing to do
        f.tracker.refresh(vec![a.clone(), b.clone()]);
        assert!(!f.tracker.is_busy());

        f.tracker.refresh(vec![a.clone(), b.clone(), c.clone()]);
        settle(&f.tracker).await;
        assert_eq!(f.tracker.current(), Some(BlobId::digest(b"abc")));
        assert_eq!(f.reaped.try_recv().unwrap(), first);
        // contributors themselves are never reaped
        assert!(f.reaped.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_contributor_is_skipped() {
        let f = fixture(ResultKind::Preview);
        let a = blob(&f.blobs, b"a").await;
        let b = blob(&f.blobs, b"b").await;
        let gone = BlobId::digest(b"evicted");

        f.tracker.refresh(vec![a.clone(), gone, b.clone()]);
        settle(&f.tracker).await;
        assert_eq!(f.tracker.current(), Some(BlobId::digest(b"ab")));
    }

    #[tokio::test]
    async fn test_failed_merge_is_retried() {
        struct Failing;

        #[async_trait]
        impl ResultMerger for Failing {
            async fn merge(&self, _: &[PathBuf], _: &Path) -> Result<(), MergeError> {
                Err(MergeError::Command("exit status 1".to_string()))
            }
        }

        let dir = TempDir::new().unwrap();
        let blobs = Arc::new(BlobCache::open(dir.path(), None).unwrap());
        let (reaper, _rx) = BlobReaper::channel();
        let tracker = MergeTracker::new("shot", ResultKind::Render, Arc::new(Failing), blobs.clone(), reaper);
        let a = blob(&blobs, b"a").await;
        let b = blob(&blobs, b"b").await;

        tracker.refresh(vec![a.clone(), b.clone()]);
        settle(&tracker).await;
        assert!(tracker.current().is_none());
        assert!(!tracker.is_current(&[a.clone(), b.clone()]));

        tracker.refresh(vec![a, b]);
        assert!(tracker.is_busy());
        settle(&tracker).await;
    }
}
