// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Partial result merging capability

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Merge command failed: {0}")]
    Command(String),

    #[error("Merge produced no output at {0}")]
    NoOutput(PathBuf),

    #[error("Merge IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Combines partial renders of the same frame into one image
#[async_trait]
pub trait ResultMerger: Send + Sync {
    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<(), MergeError>;
}
