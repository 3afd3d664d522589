// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Subprocess renderer
//!
//! Launches the configured renderer executable with the workspace as its
//! working directory and `job.json` as its last argument. Stdout and stderr
//! are merged into one line channel.

use crate::domain::renderer::{RenderExit, RenderProcess, Renderer, RendererError};
use async_trait::async_trait;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub struct ProcessRenderer {
    executable: PathBuf,
    args: Vec<String>,
}

impl ProcessRenderer {
    pub fn new(executable: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
        }
    }
}

#[async_trait]
impl Renderer for ProcessRenderer {
    async fn launch(
        &self,
        workspace: &Path,
        job_file: &Path,
    ) -> Result<Box<dyn RenderProcess>, RendererError> {
        let mut child = Command::new(&self.executable)
            .args(&self.args)
            .arg(job_file)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RendererError::Launch(format!("{}: {}", self.executable.display(), e))
            })?;

        let (tx, rx) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        info!(
            executable = %self.executable.display(),
            pid = child.id().unwrap_or_default(),
            workspace = %workspace.display(),
            "Renderer launched"
        );
        Ok(Box::new(ChildProcess { child, lines: rx }))
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

struct ChildProcess {
    child: Child,
    lines: mpsc::Receiver<String>,
}

#[async_trait]
impl RenderProcess for ChildProcess {
    async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    fn interrupt(&mut self) -> Result<(), RendererError> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        debug!(pid, "Sending SIGINT to renderer");
        // SAFETY: kill(2) has no memory-safety preconditions
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
        if rc == 0 {
            Ok(())
        } else {
            Err(RendererError::Io(std::io::Error::last_os_error()))
        }
    }

    async fn kill(&mut self) -> Result<(), RendererError> {
        debug!(pid = self.child.id().unwrap_or_default(), "Killing renderer");
        self.child.start_kill()?;
        Ok(())
    }

    async fn wait(&mut self) -> Result<RenderExit, RendererError> {
        let status = self.child.wait().await?;
        Ok(match (status.code(), status.signal()) {
            (Some(0), _) => RenderExit::Success,
            (Some(code), _) => RenderExit::Code(code),
            (None, Some(signal)) => RenderExit::Signal(signal),
            (None, None) => RenderExit::Code(-1),
        })
    }
}
