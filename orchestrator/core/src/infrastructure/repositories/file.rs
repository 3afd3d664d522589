// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! JSON-file repositories
//!
//! Writes go to a temp sibling first and are renamed into place, so a crash
//! mid-write leaves the previous snapshot intact.

use crate::domain::agent::AgentRecord;
use crate::domain::repository::{AgentRegistry, RepositoryError, TaskRepository};
use crate::domain::task::Task;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Directory of `<sha1(name)>.json` documents
struct JsonDir {
    dir: PathBuf,
}

impl JsonDir {
    fn new(dir: PathBuf) -> Result<Self, RepositoryError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", hex::encode(Sha1::digest(name.as_bytes()))))
    }

    async fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<(), RepositoryError> {
        let path = self.path_for(name);
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load_all<T: DeserializeOwned>(&self) -> Result<Vec<T>, RepositoryError> {
        let mut items = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read(&path).await?;
            match serde_json::from_slice(&raw) {
                Ok(item) => items.push(item),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot"),
            }
        }
        Ok(items)
    }

    async fn delete(&self, name: &str) -> Result<(), RepositoryError> {
        match tokio::fs::remove_file(self.path_for(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RepositoryError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

pub struct FileTaskRepository {
    store: JsonDir,
}

impl FileTaskRepository {
    pub fn new(session_dir: &Path) -> Result<Self, RepositoryError> {
        Ok(Self {
            store: JsonDir::new(session_dir.join("tasks"))?,
        })
    }
}

#[async_trait]
impl TaskRepository for FileTaskRepository {
    async fn save(&self, task: &Task) -> Result<(), RepositoryError> {
        self.store.save(&task.name, task).await
    }

    async fn load_all(&self) -> Result<Vec<Task>, RepositoryError> {
        self.store.load_all().await
    }

    async fn delete(&self, name: &str) -> Result<(), RepositoryError> {
        self.store.delete(name).await
    }
}

pub struct FileAgentRegistry {
    store: JsonDir,
}

impl FileAgentRegistry {
    pub fn new(session_dir: &Path) -> Result<Self, RepositoryError> {
        Ok(Self {
            store: JsonDir::new(session_dir.join("agents"))?,
        })
    }
}

#[async_trait]
impl AgentRegistry for FileAgentRegistry {
    async fn save(&self, record: &AgentRecord) -> Result<(), RepositoryError> {
        self.store.save(&record.name, record).await
    }

    async fn load_all(&self) -> Result<Vec<AgentRecord>, RepositoryError> {
        self.store.load_all().await
    }

    async fn delete(&self, name: &str) -> Result<(), RepositoryError> {
        self.store.delete(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::{TaskKind, TaskState};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_task_snapshot_roundtrip() {
        let dir = TempDir::new().unwrap();
        let repo = FileTaskRepository::new(dir.path()).unwrap();
        let mut task = Task::new("shot-01", TaskKind::Manager).unwrap();
        task.push_message("renderer", "hello");
        repo.save(&task).await.unwrap();

        let expected = dir.path().join("tasks").join(format!(
            "{}.json",
            hex::encode(Sha1::digest(b"shot-01"))
        ));
        assert!(expected.exists());

        let loaded = repo.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "shot-01");
        assert_eq!(loaded[0].state(), TaskState::Created);
        assert_eq!(loaded[0].messages()["renderer"], vec!["hello".to_string()]);

        repo.delete("shot-01").await.unwrap();
        assert!(repo.load_all().await.unwrap().is_empty());
        assert!(matches!(
            repo.delete("shot-01").await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_skipped() {
        let dir = TempDir::new().unwrap();
        let repo = FileAgentRegistry::new(dir.path()).unwrap();
        repo.save(&AgentRecord {
            name: "ws-01".to_string(),
            address: "10.0.0.5:8443".to_string(),
        })
        .await
        .unwrap();
        std::fs::write(dir.path().join("agents").join("broken.json"), b"{").unwrap();

        let records = repo.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address, "10.0.0.5:8443");
    }
}
