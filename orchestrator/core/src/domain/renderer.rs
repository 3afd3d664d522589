// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Renderer Process Abstraction
//!
//! The renderer is an external executable. It reads `job.json` from its
//! working directory and reports progress one line at a time:
//!
//! | Line | Meaning |
//! |------|---------|
//! | `PROGRESS <done> <total>` | samples rendered so far |
//! | `REMAINING <seconds>` | renderer's own time estimate |
//! | `PREVIEW <path>` | intermediate image written |
//! | `RENDER <path>` | final image written |
//!
//! Anything else is a free-form message.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Progress { done: u32, total: u32 },
    Remaining(u64),
    Preview(PathBuf),
    Render(PathBuf),
    Message(String),
}

impl ProgressEvent {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end();
        let (keyword, rest) = match line.split_once(' ') {
            Some((k, r)) => (k, r.trim()),
            None => return ProgressEvent::Message(line.to_string()),
        };
        let parsed = match keyword {
            "PROGRESS" => {
                let mut parts = rest.split_whitespace().map(str::parse::<u32>);
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(Ok(done)), Some(Ok(total)), None) => {
                        Some(ProgressEvent::Progress { done, total })
                    }
                    _ => None,
                }
            }
            "REMAINING" => rest.parse::<f64>().ok().filter(|s| *s >= 0.0).map(|s| {
                ProgressEvent::Remaining(s.ceil() as u64)
            }),
            "PREVIEW" if !rest.is_empty() => Some(ProgressEvent::Preview(PathBuf::from(rest))),
            "RENDER" if !rest.is_empty() => Some(ProgressEvent::Render(PathBuf::from(rest))),
            _ => None,
        };
        parsed.unwrap_or_else(|| ProgressEvent::Message(line.to_string()))
    }
}

/// How the renderer process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderExit {
    Success,
    Code(i32),
    Signal(i32),
}

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("Failed to launch renderer: {0}")]
    Launch(String),

    #[error("Renderer IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running renderer
#[async_trait]
pub trait RenderProcess: Send {
    /// Next stdout/stderr line; `None` once both streams are closed
    async fn next_line(&mut self) -> Option<String>;

    /// Ask for a graceful stop (partial result capture)
    fn interrupt(&mut self) -> Result<(), RendererError>;

    async fn kill(&mut self) -> Result<(), RendererError>;

    async fn wait(&mut self) -> Result<RenderExit, RendererError>;
}

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn launch(
        &self,
        workspace: &Path,
        job_file: &Path,
    ) -> Result<Box<dyn RenderProcess>, RendererError>;
}
