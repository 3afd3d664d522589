// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Content-Addressed Blob Cache
//!
//! Local-disk store for every file a node moves around: scene dependencies
//! uploaded by clients or the manager, previews and renders produced by the
//! renderer, merged results.
//!
//! **Layout:**
//! ```text
//! <root>/blobs/<2 hex>/<sha1>        payload
//! <root>/blobs/<2 hex>/<sha1>.json   BlobMeta
//! <root>/tmp/                        in-flight ingestion
//! <root>/workspaces/<task>/          hard-linked execution scratch dirs
//! ```
//!
//! **Guarantees:**
//! - A payload is only renamed into place after its SHA-1 matched.
//! - Store/remove/evict are serialized per digest bucket (first byte).
//! - Blobs flagged `dnd` or linked into a live workspace are never evicted.
//! - Access-time updates are coalesced and flushed by a background task.

use crate::domain::blob::{BlobError, BlobId, BlobIndex, BlobMeta};
use crate::domain::path_sanitizer::PathSanitizer;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BUCKETS: usize = 256;

/// Free-space source for the cache filesystem
pub trait SpaceProbe: Send + Sync {
    fn available(&self, path: &Path) -> std::io::Result<u64>;
}

pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn available(&self, path: &Path) -> std::io::Result<u64> {
        fs2::available_space(path)
    }
}

/// Bytes promised to an in-flight ingestion; released on drop
#[derive(Debug)]
pub struct SpaceReservation {
    required: Arc<AtomicU64>,
    bytes: u64,
}

impl SpaceReservation {
    fn new(required: Arc<AtomicU64>, bytes: u64) -> Self {
        required.fetch_add(bytes, Ordering::SeqCst);
        Self { required, bytes }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for SpaceReservation {
    fn drop(&mut self) {
        self.required.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheUsage {
    pub blobs: usize,
    pub bytes: u64,
    pub limit: Option<u64>,
    pub available: Option<u64>,
}

pub struct BlobCache {
    root: PathBuf,
    blobs_dir: PathBuf,
    tmp_dir: PathBuf,
    workspaces_dir: PathBuf,
    limit: Option<u64>,
    metas: Mutex<HashMap<BlobId, BlobMeta>>,
    dirty: Mutex<HashSet<BlobId>>,
    pins: Mutex<HashMap<BlobId, usize>>,
    workspaces: Mutex<HashMap<String, Vec<BlobId>>>,
    required: Arc<AtomicU64>,
    buckets: Vec<tokio::sync::Mutex<()>>,
    probe: Box<dyn SpaceProbe>,
    sanitizer: PathSanitizer,
}

impl BlobCache {
    /// Open (or initialize) a cache rooted at `root`
    ///
    /// Leftover temp files are discarded and metadata is rebuilt for any
    /// payload whose sibling `.json` is missing or stale.
    pub fn open(root: impl Into<PathBuf>, limit: Option<u64>) -> Result<Self, BlobError> {
        let root = root.into();
        let blobs_dir = root.join("blobs");
        let tmp_dir = root.join("tmp");
        let workspaces_dir = root.join("workspaces");

        std::fs::create_dir_all(&blobs_dir)?;
        if tmp_dir.exists() {
            std::fs::remove_dir_all(&tmp_dir)?;
        }
        std::fs::create_dir_all(&tmp_dir)?;
        if workspaces_dir.exists() {
            std::fs::remove_dir_all(&workspaces_dir)?;
        }
        std::fs::create_dir_all(&workspaces_dir)?;

        let (metas, dirty) = Self::scan(&blobs_dir)?;
        info!(
            root = %root.display(),
            blobs = metas.len(),
            limit = ?limit,
            "Blob cache opened"
        );

        Ok(Self {
            root,
            blobs_dir,
            tmp_dir,
            workspaces_dir,
            limit,
            metas: Mutex::new(metas),
            dirty: Mutex::new(dirty),
            pins: Mutex::new(HashMap::new()),
            workspaces: Mutex::new(HashMap::new()),
            required: Arc::new(AtomicU64::new(0)),
            buckets: (0..BUCKETS).map(|_| tokio::sync::Mutex::new(())).collect(),
            probe: Box::new(FsSpaceProbe),
            sanitizer: PathSanitizer::new(),
        })
    }

    pub fn with_space_probe(mut self, probe: Box<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    fn scan(
        blobs_dir: &Path,
    ) -> Result<(HashMap<BlobId, BlobMeta>, HashSet<BlobId>), BlobError> {
        let mut metas = HashMap::new();
        let mut dirty = HashSet::new();

        for bucket in std::fs::read_dir(blobs_dir)? {
            let bucket = bucket?;
            if !bucket.file_type()?.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(bucket.path())? {
                let entry = entry?;
                let file_name = entry.file_name().to_string_lossy().into_owned();
                if let Some(stem) = file_name.strip_suffix(".json") {
                    // Metadata without payload
                    if !entry.path().with_file_name(stem).exists() {
                        let _ = std::fs::remove_file(entry.path());
                    }
                    continue;
                }
                let id = match BlobId::parse(&file_name) {
                    Ok(id) if id.as_str() == file_name => id,
                    _ => {
                        warn!(path = %entry.path().display(), "Ignoring foreign file in blob cache");
                        continue;
                    }
                };
                let size = entry.metadata()?.len();
                let meta_path = entry.path().with_file_name(format!("{}.json", file_name));
                let meta = std::fs::read(&meta_path)
                    .ok()
                    .and_then(|raw| serde_json::from_slice::<BlobMeta>(&raw).ok())
                    .filter(|m| m.id == id && m.size == size);
                let meta = match meta {
                    Some(meta) => meta,
                    None => {
                        dirty.insert(id.clone());
                        BlobMeta::new(id.clone(), size)
                    }
                };
                metas.insert(id, meta);
            }
        }
        Ok((metas, dirty))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn payload_path(&self, id: &BlobId) -> PathBuf {
        self.blobs_dir.join(id.bucket()).join(id.as_str())
    }

    fn meta_path(&self, id: &BlobId) -> PathBuf {
        self.blobs_dir
            .join(id.bucket())
            .join(format!("{}.json", id.as_str()))
    }

    fn bucket(&self, id: &BlobId) -> &tokio::sync::Mutex<()> {
        &self.buckets[id.bucket_index() % BUCKETS]
    }

    pub fn contains(&self, id: &BlobId) -> bool {
        self.metas.lock().contains_key(id)
    }

    /// Metadata of a cached blob, refreshing its access time
    pub fn get(&self, id: &BlobId) -> Option<BlobMeta> {
        let mut metas = self.metas.lock();
        let meta = metas.get_mut(id)?;
        meta.touch();
        let meta = meta.clone();
        drop(metas);
        self.dirty.lock().insert(id.clone());
        Some(meta)
    }

    /// On-disk payload path of a cached blob
    pub fn blob_path(&self, id: &BlobId) -> Option<PathBuf> {
        self.get(id).map(|_| self.payload_path(id))
    }

    /// Open a blob for streaming; `Ok(None)` when it is not cached
    pub async fn open_blob(
        &self,
        id: &BlobId,
    ) -> Result<Option<(BlobMeta, tokio::fs::File)>, BlobError> {
        let meta = match self.get(id) {
            Some(meta) => meta,
            None => return Ok(None),
        };
        match tokio::fs::File::open(self.payload_path(id)).await {
            Ok(file) => Ok(Some((meta, file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(blob = %id, "Blob payload vanished; dropping metadata");
                self.metas.lock().remove(id);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ingest a byte stream
    ///
    /// When `declared` names a blob that is already cached the stream is
    /// not consumed at all. A declared digest or size that does not match
    /// the received bytes rejects the ingestion and discards the temp file.
    pub async fn store_stream<S, E>(
        &self,
        stream: S,
        declared: Option<&BlobId>,
        size: Option<u64>,
    ) -> Result<BlobMeta, BlobError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Display,
    {
        if let Some(id) = declared {
            if let Some(meta) = self.get(id) {
                debug!(blob = %id, "Blob already cached; skipping ingestion");
                return Ok(meta);
            }
        }

        let _reservation = match size {
            Some(bytes) => Some(self.free_space(bytes).await?),
            None => None,
        };

        let tmp_path = self.tmp_dir.join(uuid::Uuid::new_v4().to_string());
        let (computed, written) = match self.write_temp(&tmp_path, stream, size).await {
            Ok(result) => result,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(e);
            }
        };

        if let Some(expected) = size {
            if written != expected {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(BlobError::SizeMismatch {
                    id: computed,
                    declared: expected,
                    received: written,
                });
            }
        }

        if let Some(declared) = declared {
            if *declared != computed {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                warn!(declared = %declared, computed = %computed, "Rejected blob with mismatching digest");
                return Err(BlobError::DigestMismatch {
                    declared: declared.clone(),
                    computed,
                });
            }
        }

        self.commit(&tmp_path, computed, written).await
    }

    async fn write_temp<S, E>(
        &self,
        tmp_path: &Path,
        stream: S,
        size: Option<u64>,
    ) -> Result<(BlobId, u64), BlobError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Display,
    {
        futures::pin_mut!(stream);
        let mut file = tokio::fs::File::create(tmp_path).await?;
        let mut hasher = Sha1::new();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| BlobError::Stream(e.to_string()))?;
            written += chunk.len() as u64;
            if let Some(expected) = size {
                if written > expected {
                    return Err(BlobError::SizeMismatch {
                        id: BlobId::from_hasher(hasher),
                        declared: expected,
                        received: written,
                    });
                }
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok((BlobId::from_hasher(hasher), written))
    }

    async fn commit(&self, tmp_path: &Path, id: BlobId, size: u64) -> Result<BlobMeta, BlobError> {
        let _guard = self.bucket(&id).lock().await;

        if let Some(existing) = self.get(&id) {
            let _ = tokio::fs::remove_file(tmp_path).await;
            debug!(blob = %id, "Blob already cached; discarded duplicate ingestion");
            return Ok(existing);
        }

        let payload = self.payload_path(&id);
        if let Some(parent) = payload.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Err(e) = tokio::fs::rename(tmp_path, &payload).await {
            let _ = tokio::fs::remove_file(tmp_path).await;
            return Err(e.into());
        }

        let meta = BlobMeta::new(id.clone(), size);
        self.write_meta(&meta).await?;
        self.metas.lock().insert(id.clone(), meta.clone());
        debug!(blob = %id, size, "Blob stored");
        Ok(meta)
    }

    /// Ingest a local file (renderer output, merge result)
    pub async fn store_file(&self, path: &Path) -> Result<BlobMeta, BlobError> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        self.store_stream(ReaderStream::new(file), None, Some(size))
            .await
    }

    pub async fn store_bytes(&self, data: Bytes) -> Result<BlobMeta, BlobError> {
        let size = data.len() as u64;
        let stream = futures::stream::once(async move { Ok::<_, std::convert::Infallible>(data) });
        self.store_stream(stream, None, Some(size)).await
    }

    /// Delete a blob; `Ok(false)` when it was not cached
    pub async fn remove(&self, id: &BlobId) -> Result<bool, BlobError> {
        let _guard = self.bucket(id).lock().await;

        if self.is_pinned(id) {
            return Err(BlobError::Pinned(id.clone()));
        }
        if self.metas.lock().remove(id).is_none() {
            return Ok(false);
        }
        self.dirty.lock().remove(id);

        for path in [self.payload_path(id), self.meta_path(id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(blob = %id, "Blob removed");
        Ok(true)
    }

    /// Flag a blob as do-not-delete; persisted immediately
    pub async fn set_dnd(&self, id: &BlobId, dnd: bool) -> Result<bool, BlobError> {
        let meta = {
            let mut metas = self.metas.lock();
            match metas.get_mut(id) {
                Some(meta) => {
                    meta.dnd = dnd;
                    meta.clone()
                }
                None => return Ok(false),
            }
        };
        self.write_meta(&meta).await?;
        self.dirty.lock().remove(id);
        Ok(true)
    }

    fn is_pinned(&self, id: &BlobId) -> bool {
        self.pins.lock().get(id).copied().unwrap_or(0) > 0
    }

    fn pin(&self, id: &BlobId) {
        *self.pins.lock().entry(id.clone()).or_insert(0) += 1;
    }

    fn unpin(&self, id: &BlobId) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                pins.remove(id);
            }
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.metas.lock().values().map(|m| m.size).sum()
    }

    /// Space usable for new blobs: filesystem free space, capped by the
    /// configured cache limit
    pub fn available_space(&self) -> Result<u64, BlobError> {
        let fs_available = self.probe.available(&self.root)?;
        Ok(match self.limit {
            Some(limit) => fs_available.min(limit.saturating_sub(self.used_bytes())),
            None => fs_available,
        })
    }

    fn eviction_candidate(&self) -> Option<BlobId> {
        let metas = self.metas.lock();
        let pins = self.pins.lock();
        metas
            .values()
            .filter(|m| !m.dnd && pins.get(&m.id).copied().unwrap_or(0) == 0)
            .min_by_key(|m| m.access_time)
            .map(|m| m.id.clone())
    }

    /// Reserve `bytes` for an upcoming ingestion, evicting least recently
    /// used blobs when the outstanding reservations do not fit
    pub async fn free_space(&self, bytes: u64) -> Result<SpaceReservation, BlobError> {
        let reservation = SpaceReservation::new(self.required.clone(), bytes);

        loop {
            let required = self.required.load(Ordering::SeqCst);
            let available = self.available_space()?;
            if available >= required {
                return Ok(reservation);
            }

            let Some(victim) = self.eviction_candidate() else {
                warn!(required, available, "Blob cache cannot free enough space");
                return Err(BlobError::InsufficientSpace {
                    required,
                    available,
                });
            };
            match self.remove(&victim).await {
                Ok(_) => info!(blob = %victim, "Evicted blob to free space"),
                // Linked into a workspace since the candidate was chosen
                Err(BlobError::Pinned(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Hard-link `files` into a fresh scratch directory and pin them
    ///
    /// Falls back to copying when the workspace lives on another device.
    pub async fn workspace_create(
        &self,
        name: &str,
        files: &BTreeMap<String, BlobId>,
    ) -> Result<PathBuf, BlobError> {
        let key = self
            .sanitizer
            .canonical_key(name)
            .map_err(|e| BlobError::InvalidPath(e.to_string()))?;
        if key.contains('/') {
            return Err(BlobError::InvalidPath(name.to_string()));
        }

        if self.workspaces.lock().contains_key(name) {
            self.workspace_clean(name);
        }
        let dir = self.workspaces_dir.join(&key);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;

        let mut pinned = Vec::with_capacity(files.len());
        for (path, id) in files {
            {
                // Serialized with `remove` so a pinned payload stays on disk
                let _guard = self.bucket(id).lock().await;
                self.pin(id);
            }
            pinned.push(id.clone());
            if let Err(e) = self.link_into(&dir, path, id).await {
                warn!(workspace = %name, path = %path, error = %e, "Failed to populate workspace");
                for id in &pinned {
                    self.unpin(id);
                }
                let _ = tokio::fs::remove_dir_all(&dir).await;
                return Err(e);
            }
        }

        self.workspaces.lock().insert(name.to_string(), pinned);
        debug!(workspace = %name, files = files.len(), "Workspace created");
        Ok(dir)
    }

    async fn link_into(&self, dir: &Path, path: &str, id: &BlobId) -> Result<(), BlobError> {
        let target = self
            .sanitizer
            .resolve(path, dir)
            .map_err(|e| BlobError::InvalidPath(e.to_string()))?;
        if self.get(id).is_none() {
            return Err(BlobError::NotFound(id.clone()));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let source = self.payload_path(id);
        if tokio::fs::hard_link(&source, &target).await.is_err() {
            tokio::fs::copy(&source, &target).await?;
        }
        Ok(())
    }

    /// Unpin a workspace's blobs and delete its directory
    ///
    /// Synchronous so it can run from drop guards.
    pub fn workspace_clean(&self, name: &str) {
        let pinned = self.workspaces.lock().remove(name);
        if let Some(pinned) = pinned {
            for id in &pinned {
                self.unpin(id);
            }
        }
        let dir = self.workspaces_dir.join(name);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(workspace = %name, error = %e, "Failed to remove workspace directory");
            }
        }
        debug!(workspace = %name, "Workspace cleaned");
    }

    async fn write_meta(&self, meta: &BlobMeta) -> Result<(), BlobError> {
        let raw = serde_json::to_vec_pretty(meta)?;
        tokio::fs::write(self.meta_path(&meta.id), raw).await?;
        Ok(())
    }

    /// Persist coalesced metadata changes
    pub async fn flush(&self) -> Result<usize, BlobError> {
        let ids: Vec<BlobId> = self.dirty.lock().drain().collect();
        let mut written = 0;
        for id in ids {
            let meta = self.metas.lock().get(&id).cloned();
            if let Some(meta) = meta {
                self.write_meta(&meta).await?;
                written += 1;
            }
        }
        if written > 0 {
            debug!(written, "Flushed blob metadata");
        }
        Ok(written)
    }

    /// Background metadata flusher; flushes a final time on shutdown
    pub fn spawn_flusher(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = cache.flush().await {
                            warn!(error = %e, "Blob metadata flush failed");
                        }
                    }
                }
            }
            if let Err(e) = cache.flush().await {
                warn!(error = %e, "Final blob metadata flush failed");
            }
        })
    }

    pub fn usage(&self) -> CacheUsage {
        let (blobs, bytes) = {
            let metas = self.metas.lock();
            (metas.len(), metas.values().map(|m| m.size).sum())
        };
        CacheUsage {
            blobs,
            bytes,
            limit: self.limit,
            available: self.available_space().ok(),
        }
    }
}

impl BlobIndex for BlobCache {
    fn contains_blob(&self, id: &BlobId) -> bool {
        self.contains(id)
    }
}
