//! Launches and supervises one external muxer process.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{RecorderError, Result};

/// How long each rung of the graceful-stop ladder waits. Overridable so the
/// test suite does not sit through production grace windows.
#[derive(Debug, Clone, Copy)]
pub struct StopGrace {
    /// Wait for a process that may already have exited on its own.
    pub early_exit: Duration,
    /// Wait after writing the `q` quit command to stdin.
    pub quit: Duration,
    /// Wait after the caller has starved the process of input.
    pub starved: Duration,
}

impl Default for StopGrace {
    fn default() -> Self {
        Self {
            early_exit: Duration::from_millis(300),
            quit: Duration::from_secs(30),
            starved: Duration::from_secs(5),
        }
    }
}

/// A running muxer. Holds the child with `kill_on_drop`, so dropping the
/// handle is guaranteed to signal the process even on error paths.
#[derive(Debug)]
pub struct MuxerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    started_rx: watch::Receiver<Option<DateTime<Utc>>>,
    failed_rx: watch::Receiver<Option<String>>,
    stderr_task: JoinHandle<()>,
    pub grace: StopGrace,
}

impl MuxerProcess {
    /// Spawn the muxer with the given argument vector. Stderr is drained by
    /// a dedicated task that watches for the first progress line and for
    /// repeated error lines.
    pub fn spawn(
        program: &str,
        args: &[String],
        label: &str,
        error_threshold: usize,
    ) -> Result<Self> {
        tracing::info!(%program, %label, "spawning muxer: {}", args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(RecorderError::MuxerSpawnFailed)?;

        let stdin = child.stdin.take();
        let stderr = child.stderr.take().ok_or_else(|| {
            RecorderError::Transport("muxer spawned without a stderr pipe".to_string())
        })?;

        let (started_tx, started_rx) = watch::channel(None);
        let (failed_tx, failed_rx) = watch::channel(None);
        let task_label = label.to_string();
        let stderr_task = tokio::spawn(async move {
            read_diagnostics(stderr, task_label, error_threshold, started_tx, failed_tx).await;
        });

        Ok(Self {
            child,
            stdin,
            started_rx,
            failed_rx,
            stderr_task,
            grace: StopGrace::default(),
        })
    }

    /// The instant the muxer was first observed emitting frames, if any.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_rx.borrow()
    }

    /// A watch that resolves once the muxer reports processing.
    pub fn started_watch(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.started_rx.clone()
    }

    /// The escalated diagnostic line, if stderr errors crossed the threshold.
    pub fn failure(&self) -> Option<String> {
        self.failed_rx.borrow().clone()
    }

    /// Non-blocking exit check; used by recording monitors to detect crashes.
    pub fn try_exited(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Rungs 1–2 of the stop ladder: give an already-finished process a
    /// moment, then ask for a graceful quit over stdin and wait.
    pub async fn request_quit(&mut self) -> Option<ExitStatus> {
        if let Some(status) = self.wait_for(self.grace.early_exit).await {
            return Some(status);
        }

        if let Some(mut stdin) = self.stdin.take() {
            // `q` on stdin is the muxer family's graceful-quit command;
            // closing the pipe afterwards covers builds that only react to
            // end of input.
            let _ = stdin.write_all(b"q\n").await;
            let _ = stdin.shutdown().await;
        }

        self.wait_for(self.grace.quit).await
    }

    /// Rung 3: the caller has closed consumers and endpoints, so the muxer
    /// is starved of input; give it one more chance to finalize.
    pub async fn wait_starved(&mut self) -> Option<ExitStatus> {
        self.wait_for(self.grace.starved).await
    }

    /// Rung 4: terminate.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::warn!("failed to signal muxer: {e}");
        }
        let _ = self.child.wait().await;
    }

    async fn wait_for(&mut self, window: Duration) -> Option<ExitStatus> {
        match timeout(window, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                tracing::warn!("muxer wait failed: {e}");
                None
            }
            Err(_) => None,
        }
    }
}

impl Drop for MuxerProcess {
    fn drop(&mut self) {
        self.stderr_task.abort();
    }
}

async fn read_diagnostics(
    stderr: tokio::process::ChildStderr,
    label: String,
    error_threshold: usize,
    started_tx: watch::Sender<Option<DateTime<Utc>>>,
    failed_tx: watch::Sender<Option<String>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    let mut error_count = 0usize;

    while let Ok(Some(line)) = lines.next_line().await {
        if started_tx.borrow().is_none() && line.trim_start().starts_with("frame=") {
            tracing::info!(%label, "muxer started processing frames");
            let _ = started_tx.send(Some(Utc::now()));
        }

        let suspicious = line.to_ascii_lowercase().contains("error")
            || line.contains("Invalid argument")
            || line.contains("dropping frame");

        if suspicious {
            error_count += 1;
            tracing::warn!(%label, error_count, "muxer: {line}");
            if error_count >= error_threshold && failed_tx.borrow().is_none() {
                let _ = failed_tx.send(Some(line));
            }
        } else {
            tracing::debug!(%label, "muxer: {line}");
        }
    }
}
