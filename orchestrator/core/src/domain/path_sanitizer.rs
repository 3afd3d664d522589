// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Path Sanitizer Domain Service
//!
//! Validates the relative paths of a task's file map. Every entry must
//! resolve to an absolute path inside the task workspace: no root or
//! drive prefix, no `..` components, no NUL bytes.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Integrity rule shared by task checks, uploads and workspaces

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathSanitizerError {
    #[error("Path traversal attempt detected: {0}")]
    PathTraversal(String),

    #[error("Path must be relative to the workspace: {0}")]
    NotRelative(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Path too long: {0}")]
    PathTooLong(String),
}

/// Workspace path validation
pub struct PathSanitizer {
    max_path_len: usize,
}

impl PathSanitizer {
    pub fn new() -> Self {
        Self { max_path_len: 4096 }
    }

    pub fn with_max_length(max_path_len: usize) -> Self {
        Self { max_path_len }
    }

    /// Normalize a file-map path into a clean relative path
    ///
    /// `.` components and duplicate separators are dropped; anything that
    /// could escape the workspace is rejected.
    pub fn normalize(&self, path: &str) -> Result<PathBuf, PathSanitizerError> {
        if path.len() > self.max_path_len {
            return Err(PathSanitizerError::PathTooLong(path.to_string()));
        }
        if path.contains('\0') {
            return Err(PathSanitizerError::InvalidPath(
                "Path contains null byte".to_string(),
            ));
        }

        let mut normalized = PathBuf::new();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    tracing::warn!(path = %path, "Rejected file path with '..' component");
                    return Err(PathSanitizerError::PathTraversal(path.to_string()));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(PathSanitizerError::NotRelative(path.to_string()));
                }
            }
        }

        if normalized.as_os_str().is_empty() {
            return Err(PathSanitizerError::InvalidPath(format!(
                "'{}' does not name a file",
                path
            )));
        }
        Ok(normalized)
    }

    /// Resolve a file-map path under `root`
    ///
    /// The returned path is absolute whenever `root` is.
    pub fn resolve(&self, path: &str, root: &Path) -> Result<PathBuf, PathSanitizerError> {
        let relative = self.normalize(path)?;
        Ok(root.join(relative))
    }

    /// Canonical string form used as file-map key
    pub fn canonical_key(&self, path: &str) -> Result<String, PathSanitizerError> {
        let relative = self.normalize(path)?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Ok(parts.join("/"))
    }
}

impl Default for PathSanitizer {
    fn default() -> Self {
        Self::new()
    }
}
