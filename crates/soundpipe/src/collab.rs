//! Collaborator subprocess execution.
//!
//! Every external stage call is a shell command: the stage input payload
//! is written to the child's stdin, stdout is the reply. Calls carry a
//! per-call timeout and are killed cooperatively on cancellation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Timeout for capturing stdout/stderr after the process exits or is
/// killed. Normally I/O completes immediately after process death, but a
/// backed-up pipe must not hang the run.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes to capture from stdout/stderr. Collaborator replies are
/// small; this guards against a runaway child.
const MAX_OUTPUT_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout after {0} seconds")]
    Timeout(u32),
    #[error("exited with code {code}: {stderr}")]
    ExitCode { code: i32, stderr: String },
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, InvokeError>;

/// How the process wait loop terminated.
enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// One configured collaborator command.
#[derive(Debug, Clone)]
pub struct Collaborator {
    command: String,
    timeout_sec: u32,
    working_dir: PathBuf,
}

/// Read from an async reader with a maximum byte limit; excess input is
/// drained and discarded.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            warn!(max_bytes, "collaborator output exceeded limit, truncating");
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }

        let to_take = n.min(remaining);
        buf.extend_from_slice(&chunk[..to_take]);
    }

    Ok(buf)
}

impl Collaborator {
    pub fn new(command: impl Into<String>, timeout_sec: u32, working_dir: &Path) -> Self {
        Self {
            command: command.into(),
            timeout_sec,
            working_dir: working_dir.to_path_buf(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Run the command once: `input` on stdin, trimmed-of-nothing stdout
    /// back on exit 0. Non-zero exits carry stderr for the classifier.
    pub async fn invoke(&self, input: &str, cancel: &CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(InvokeError::Cancelled);
        }

        debug!(command = %self.command, input_bytes = input.len(), "spawning collaborator");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Feed the payload and close stdin so line-reading children see EOF.
        if let Some(mut stdin) = child.stdin.take() {
            let payload = input.to_string();
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(payload.as_bytes()).await {
                    warn!(error = %err, "failed writing collaborator stdin");
                }
                drop(stdin);
            });
        }

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(read_bounded(stdout, MAX_OUTPUT_BYTES)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_OUTPUT_BYTES)));

        let started = Instant::now();
        let timeout_duration = Duration::from_secs(u64::from(self.timeout_sec));

        let outcome = loop {
            if self.timeout_sec > 0 && started.elapsed() >= timeout_duration {
                warn!(
                    command = %self.command,
                    timeout_sec = self.timeout_sec,
                    "collaborator timed out; killing"
                );
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill timed-out collaborator");
                }
                let _ = child.wait().await;
                break ProcessOutcome::TimedOut;
            }

            let remaining = if self.timeout_sec > 0 {
                timeout_duration.saturating_sub(started.elapsed())
            } else {
                Duration::MAX
            };

            tokio::select! {
                result = child.wait() => {
                    match result {
                        Ok(status) => break ProcessOutcome::Completed(status),
                        Err(e) => return Err(InvokeError::Io(e)),
                    }
                }
                () = cancel.cancelled() => {
                    debug!(command = %self.command, "cancellation requested; killing collaborator");
                    if let Err(err) = child.kill().await {
                        warn!(error = %err, "failed to kill cancelled collaborator");
                    }
                    let _ = child.wait().await;
                    break ProcessOutcome::Cancelled;
                }
                () = tokio::time::sleep(remaining.min(Duration::from_secs(30))) => {
                    // Loop to re-check timeout; doubles as a heartbeat.
                    debug!(
                        command = %self.command,
                        elapsed_sec = started.elapsed().as_secs(),
                        "collaborator still running"
                    );
                }
            }
        };

        let stdout = capture(stdout_task, "stdout").await;
        let stderr = capture(stderr_task, "stderr").await;

        match outcome {
            ProcessOutcome::TimedOut => Err(InvokeError::Timeout(self.timeout_sec)),
            ProcessOutcome::Cancelled => Err(InvokeError::Cancelled),
            ProcessOutcome::Completed(status) => {
                let code = status.code().unwrap_or(-1);
                if code != 0 {
                    return Err(InvokeError::ExitCode {
                        code,
                        stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
                    });
                }
                Ok(String::from_utf8_lossy(&stdout).to_string())
            }
        }
    }
}

/// Join an output-capture task, tolerating failures with a warning.
async fn capture(
    task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>,
    label: &str,
) -> Vec<u8> {
    match task {
        Some(task) => match timeout(IO_CAPTURE_TIMEOUT, task).await {
            Ok(Ok(Ok(buf))) => buf,
            Ok(Ok(Err(err))) => {
                warn!(error = %err, "{label} capture failed");
                Vec::new()
            }
            Ok(Err(err)) => {
                warn!(error = %err, "{label} task panicked");
                Vec::new()
            }
            Err(_) => {
                warn!("{label} capture timed out");
                Vec::new()
            }
        },
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collab(cmd: &str, timeout_sec: u32, dir: &Path) -> Collaborator {
        Collaborator::new(cmd, timeout_sec, dir)
    }

    #[tokio::test]
    async fn echoes_stdin_through() {
        let dir = tempfile::TempDir::new().unwrap();
        let c = collab("cat", 10, dir.path());
        let out = c.invoke("hello payload", &CancellationToken::new()).await.unwrap();
        assert_eq!(out, "hello payload");
    }

    #[tokio::test]
    async fn captures_stdout() {
        let dir = tempfile::TempDir::new().unwrap();
        let c = collab("echo reply", 10, dir.path());
        let out = c.invoke("", &CancellationToken::new()).await.unwrap();
        assert_eq!(out.trim(), "reply");
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let dir = tempfile::TempDir::new().unwrap();
        let c = collab("echo boom >&2; exit 3", 10, dir.path());
        let err = c.invoke("", &CancellationToken::new()).await.unwrap_err();
        match err {
            InvokeError::ExitCode { code, stderr } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected ExitCode, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn times_out_and_kills() {
        let dir = tempfile::TempDir::new().unwrap();
        let c = collab("sleep 5", 1, dir.path());
        let start = Instant::now();
        let err = c.invoke("", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, InvokeError::Timeout(1)));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn cancellation_kills_in_flight_call() {
        let dir = tempfile::TempDir::new().unwrap();
        let c = collab("sleep 10", 0, dir.path());
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_clone.cancel();
        });

        let start = Instant::now();
        let err = c.invoke("", &cancel).await.unwrap_err();
        assert!(matches!(err, InvokeError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn already_cancelled_returns_without_spawning() {
        let dir = tempfile::TempDir::new().unwrap();
        let c = collab("echo nope", 10, dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = c.invoke("", &cancel).await.unwrap_err();
        assert!(matches!(err, InvokeError::Cancelled));
    }

    #[tokio::test]
    async fn runs_in_working_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let c = collab("cat marker.txt", 10, dir.path());
        let out = c.invoke("", &CancellationToken::new()).await.unwrap();
        assert_eq!(out, "here");
    }
}
