//! Worker wrapper invocation.
//!
//! Workers are opaque child processes taking `--task-type`, `--prompt`,
//! and `--task-id`, returning an exit code plus captured stdout/stderr.
//! Invocation is bounded by a wall-clock timeout and cooperative
//! cancellation; both terminate the worker's whole process group.

use std::process::Stdio;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};

/// The closed list of transient failure markers. An error text matching
/// any of these is eligible for retry; everything else is a hard failure.
pub const TRANSIENT_MARKERS: &[&str] = &[
    "timed out",
    "temporarily unavailable",
    "connection reset",
    "broken pipe",
    "too many requests",
    "service unavailable",
];

/// Whether an error text matches a transient marker (case-insensitive).
///
/// This is the single transient check used everywhere; keep marker
/// semantics here.
pub fn is_transient_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Captured output of a finished worker process.
#[derive(Debug, Clone)]
pub struct WorkerOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl WorkerOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Delay before retry attempt `attempt` (1-based): exponential backoff
/// from `backoff_seconds` plus bounded uniform jitter.
pub fn retry_delay(attempt: u32, backoff_seconds: f64, jitter_seconds: f64) -> Duration {
    let base = backoff_seconds.max(0.0) * 2f64.powi(attempt.saturating_sub(1) as i32);
    let jitter = if jitter_seconds > 0.0 {
        rand::rng().random_range(0.0..jitter_seconds)
    } else {
        0.0
    };
    Duration::from_secs_f64(base + jitter)
}

async fn read_all<R: tokio::io::AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

/// Terminate a worker and its process group: SIGTERM first, SIGKILL after
/// a short grace period.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The worker was spawned as a process-group leader; signal the
        // whole group so wrapper-spawned children die too.
        let ret = unsafe { libc::killpg(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            warn!(pid, "SIGTERM to worker process group failed");
        }
    }

    let exited = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
    if exited.is_err() {
        debug!("worker did not exit after SIGTERM, sending SIGKILL");
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            unsafe {
                libc::killpg(pid as i32, libc::SIGKILL);
            }
        }
        let _ = child.kill().await;
    }
}

/// Invoke a worker wrapper under a wall-clock timeout.
///
/// Returns `Timeout` when the budget elapses and `Transport` when the
/// binary cannot be spawned; a non-zero exit is NOT an error here -- the
/// caller inspects `WorkerOutput` and the transient markers.
pub async fn invoke(
    command: &str,
    args: &[String],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<WorkerOutput> {
    let started = Instant::now();

    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| CoreError::Transport(format!("failed to spawn worker {command:?}: {e}")))?;

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(read_all(stdout_pipe));
    let stderr_task = tokio::spawn(read_all(stderr_pipe));

    // The wait future borrows the child; keep the borrow inside this
    // block so the timeout/cancel paths can still terminate it.
    enum WaitEvent {
        Exited(std::io::Result<std::process::ExitStatus>),
        Cancelled,
    }
    let waited = tokio::time::timeout(timeout, async {
        tokio::select! {
            status = child.wait() => WaitEvent::Exited(status),
            _ = cancel.cancelled() => WaitEvent::Cancelled,
        }
    })
    .await;

    let status = match waited {
        Err(_elapsed) => {
            terminate(&mut child).await;
            return Err(CoreError::Timeout { seconds: timeout.as_secs() });
        }
        Ok(WaitEvent::Cancelled) => {
            terminate(&mut child).await;
            return Err(CoreError::DispatchFailed("worker cancelled".to_owned()));
        }
        Ok(WaitEvent::Exited(status)) => {
            status.map_err(|e| CoreError::Transport(format!("worker wait failed: {e}")))?
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(WorkerOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}
