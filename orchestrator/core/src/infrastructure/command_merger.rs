// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! External merge executable
//!
//! Invoked as `<exe> <output> <input>...` from the directory holding the
//! inputs. A non-zero exit fails the merge; its stderr tail is reported.

use crate::domain::merger::{MergeError, ResultMerger};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

pub struct CommandMerger {
    executable: PathBuf,
}

impl CommandMerger {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

#[async_trait]
impl ResultMerger for CommandMerger {
    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError> {
        let mut command = Command::new(&self.executable);
        command.arg(output).args(inputs).kill_on_drop(true);
        if let Some(dir) = output.parent() {
            command.current_dir(dir);
        }
        debug!(executable = %self.executable.display(), inputs = inputs.len(), "Running merge command");

        let result = command
            .output()
            .await
            .map_err(|e| MergeError::Command(format!("{}: {}", self.executable.display(), e)))?;
        if result.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&result.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        Err(MergeError::Command(format!(
            "{} ({})",
            result.status,
            tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn script(dir: &TempDir, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("merge.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_merge_invokes_command() {
        let dir = TempDir::new().unwrap();
        let merger = CommandMerger::new(script(&dir, "out=$1; shift; cat \"$@\" > \"$out\""));
        std::fs::write(dir.path().join("a"), "1").unwrap();
        std::fs::write(dir.path().join("b"), "2").unwrap();
        let output = dir.path().join("out");

        merger
            .merge(&[dir.path().join("a"), dir.path().join("b")], &output)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(output).unwrap(), "12");
    }

    #[tokio::test]
    async fn test_failure_reports_stderr() {
        let dir = TempDir::new().unwrap();
        let merger = CommandMerger::new(script(&dir, "echo 'bad input' >&2; exit 4"));
        let err = merger
            .merge(&[dir.path().join("a")], &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad input"));
    }
}
