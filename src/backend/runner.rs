//! Serialized runtime-CLI invocation with timeout-kill semantics.
//!
//! Container runtimes are driven through their CLI (`docker`, `kubectl`)
//! using `tokio::process::Command` with structured args, never a shell.
//! Invocations are serialized through a mutex because the underlying tools
//! do not reliably support concurrent sessions. On timeout the child process
//! is killed, not just the future.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::StevedoreError;

/// Collected output of one CLI invocation. Non-zero exit codes are returned
/// to the caller for interpretation, not mapped to errors here.
#[derive(Debug, Clone)]
pub struct CliOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CliOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs one runtime CLI with bounded wall-clock time per invocation.
pub struct CliRunner {
    program: String,
    timeout: Duration,
    /// Serializes invocations; the runtime CLIs misbehave under concurrency.
    lock: Mutex<()>,
}

impl CliRunner {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
            lock: Mutex::new(()),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the CLI with the given args and collect output.
    pub async fn run(&self, args: &[&str]) -> crate::Result<CliOutput> {
        self.run_with_stdin(args, None).await
    }

    /// Run the CLI, optionally writing bytes to its stdin first.
    pub async fn run_with_stdin(
        &self,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> crate::Result<CliOutput> {
        let _guard = self.lock.lock().await;
        let start = Instant::now();

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(args);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            StevedoreError::BackendUnavailable(
                self.program.clone(),
                format!("failed to spawn: {}", e),
            )
        })?;

        if let Some(bytes) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                let _ = pipe.write_all(bytes).await;
                // Dropping the pipe closes stdin so the child sees EOF.
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let output = tokio::select! {
            result = async {
                let mut stdout_bytes = Vec::new();
                let mut stderr_bytes = Vec::new();
                if let Some(mut out) = stdout_pipe {
                    let _ = out.read_to_end(&mut stdout_bytes).await;
                }
                if let Some(mut err) = stderr_pipe {
                    let _ = err.read_to_end(&mut stderr_bytes).await;
                }
                let status = child.wait().await.map_err(|e| {
                    StevedoreError::BackendUnavailable(
                        self.program.clone(),
                        format!("process wait error: {}", e),
                    )
                })?;
                Ok::<_, StevedoreError>((status, stdout_bytes, stderr_bytes))
            } => result?,
            _ = tokio::time::sleep(self.timeout) => {
                let _ = child.kill().await;
                return Err(StevedoreError::Timeout(self.program.clone()));
            }
        };

        let (status, stdout_bytes, stderr_bytes) = output;
        let result = CliOutput {
            status: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
        };

        tracing::debug!(
            program = %self.program,
            args = ?args,
            exit_code = result.status,
            duration_ms = start.elapsed().as_millis() as u64,
            "runtime CLI invocation"
        );
        Ok(result)
    }

    /// Spawn the CLI for a long-lived line stream (e.g. `logs --follow`).
    ///
    /// Lines are forwarded to the returned channel until the child exits or
    /// the token cancels; the child is killed on cancellation. Not serialized
    /// through the invocation lock — streaming sessions are read-only.
    pub fn spawn_streaming(
        &self,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        cancel: CancellationToken,
    ) -> crate::Result<mpsc::Receiver<String>> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&args);
        cmd.envs(env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|e| {
            StevedoreError::BackendUnavailable(
                self.program.clone(),
                format!("failed to spawn: {}", e),
            )
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            StevedoreError::BackendUnavailable(
                self.program.clone(),
                "failed to open stdout pipe".to_string(),
            )
        })?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                if tx.send(line).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) | Err(_) => break,
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            let _ = child.kill().await;
        });

        Ok(rx)
    }
}
