//! stdio transport to a deployed MCP server.
//!
//! Spawns the server command with piped stdin/stdout wired to a
//! line-delimited JSON-RPC codec. Writes are serialized per session; reads
//! are matched to writes by request id through a pending-call map. Non-JSON
//! stdout lines are discarded silently so noisy servers do not corrupt the
//! stream. A dead child fails every outstanding request with
//! `ConnectionClosed`. Close sends a terminate signal, waits a bounded grace
//! period, then hard-kills.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::backend::ExecSpec;
use crate::error::StevedoreError;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

/// Default per-call timeout.
pub const DEFAULT_STDIO_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between terminate signal and hard kill.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

pub struct StdioConnection {
    label: String,
    /// Serializes writes: one frame at a time per session.
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: PendingMap,
    next_id: AtomicU64,
    timeout: Duration,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl StdioConnection {
    /// Spawn the command and wire up the codec tasks.
    pub fn spawn(
        label: impl Into<String>,
        spec: &ExecSpec,
        timeout: Duration,
    ) -> crate::Result<Self> {
        let label = label.into();
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.envs(spec.env.clone());
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            tracing::warn!(server = %label, program = %spec.program, error = %e, "stdio spawn failed");
            StevedoreError::ConnectionClosed(label.clone())
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| StevedoreError::ConnectionClosed(label.clone()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StevedoreError::ConnectionClosed(label.clone()))?;
        let stderr = child.stderr.take();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        // Reader task: match response lines to pending requests by id.
        {
            let pending = pending.clone();
            let closed = closed.clone();
            let cancel = cancel.clone();
            let label = label.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    tokio::select! {
                        line = lines.next_line() => {
                            match line {
                                Ok(Some(line)) => {
                                    match serde_json::from_str::<JsonRpcResponse>(&line) {
                                        Ok(response) => {
                                            let Some(id) = response.request_id() else {
                                                tracing::debug!(server = %label, "ignoring frame without numeric id");
                                                continue;
                                            };
                                            let sender = pending.lock().await.remove(&id);
                                            match sender {
                                                Some(tx) => {
                                                    let _ = tx.send(response);
                                                }
                                                None => {
                                                    tracing::debug!(server = %label, id, "response for unknown request id");
                                                }
                                            }
                                        }
                                        Err(_) => {
                                            tracing::debug!(server = %label, line = %line, "discarding non-JSON stdout line");
                                        }
                                    }
                                }
                                Ok(None) | Err(_) => break,
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
                // EOF or cancellation: every outstanding request fails.
                closed.store(true, Ordering::SeqCst);
                pending.lock().await.clear();
            });
        }

        // Drain stderr at debug level.
        if let Some(stderr) = stderr {
            let label = label.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    tokio::select! {
                        line = lines.next_line() => {
                            match line {
                                Ok(Some(line)) => {
                                    tracing::debug!(server = %label, line = %line, "server stderr");
                                }
                                Ok(None) | Err(_) => break,
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            });
        }

        Ok(Self {
            label,
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            pending,
            next_id: AtomicU64::new(1),
            timeout,
            closed,
            cancel,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Issue one JSON-RPC call and await the id-matched response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> crate::Result<Value> {
        if self.is_closed() {
            return Err(StevedoreError::ConnectionClosed(self.label.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let mut frame = serde_json::to_string(&request)
            .map_err(|e| StevedoreError::Protocol(self.label.clone(), e.to_string()))?;
        frame.push('\n');

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let write_failed = {
            let mut guard = self.stdin.lock().await;
            match guard.as_mut() {
                None => true,
                Some(stdin) => {
                    stdin.write_all(frame.as_bytes()).await.is_err()
                        || stdin.flush().await.is_err()
                }
            }
        };
        if write_failed {
            self.pending.lock().await.remove(&id);
            return Err(StevedoreError::ConnectionClosed(self.label.clone()));
        }

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Err(_elapsed) => {
                self.pending.lock().await.remove(&id);
                return Err(StevedoreError::Timeout(self.label.clone()));
            }
            Ok(Err(_dropped)) => {
                return Err(StevedoreError::ConnectionClosed(self.label.clone()));
            }
            Ok(Ok(response)) => response,
        };

        if let Some(error) = response.error {
            return Err(StevedoreError::Protocol(
                self.label.clone(),
                format!("rpc error {}: {}", error.code, error.message),
            ));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Close the session: cancel the codec tasks, close stdin, send a
    /// terminate signal, and hard-kill after the grace period.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        self.pending.lock().await.clear();

        // Closing stdin lets well-behaved servers exit on their own.
        self.stdin.lock().await.take();

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(_) => {}
            Err(_elapsed) => {
                tracing::debug!(server = %self.label, "grace period elapsed, killing child");
                let _ = child.kill().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn shell_spec(script: &str) -> ExecSpec {
        ExecSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
        }
    }

    /// Responds to every input line with a fixed result for id 1.
    fn responder_spec() -> ExecSpec {
        shell_spec(
            r#"while read line; do printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'; done"#,
        )
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let conn =
            StdioConnection::spawn("test", &responder_spec(), Duration::from_secs(5)).unwrap();
        let result = conn.request("initialize", None).await.unwrap();
        assert_eq!(result["ok"], true);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_noisy_stdout_is_filtered() {
        let spec = shell_spec(
            r#"echo starting up...; while read line; do echo not json; printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'; done"#,
        );
        let conn = StdioConnection::spawn("test", &spec, Duration::from_secs(5)).unwrap();
        let result = conn.request("tools/list", None).await.unwrap();
        assert_eq!(result["ok"], true);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_dead_child_is_connection_closed() {
        // `true` exits immediately; the request must not hang.
        let spec = shell_spec("exit 0");
        let conn = StdioConnection::spawn("test", &spec, Duration::from_secs(5)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let result = conn.request("initialize", None).await;
        assert!(matches!(result, Err(StevedoreError::ConnectionClosed(label)) if label == "test"));
        conn.close().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_connection_closed() {
        let spec = ExecSpec {
            program: "/this/program/does/not/exist".to_string(),
            args: vec![],
            env: BTreeMap::new(),
        };
        let result = StdioConnection::spawn("test", &spec, Duration::from_secs(5));
        assert!(matches!(result, Err(StevedoreError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_unresponsive_server_times_out() {
        let spec = shell_spec("while read line; do sleep 30; done");
        let conn = StdioConnection::spawn("test", &spec, Duration::from_millis(300)).unwrap();
        let result = conn.request("initialize", None).await;
        assert!(matches!(result, Err(StevedoreError::Timeout(_))));
        conn.close().await;
    }

    #[tokio::test]
    async fn test_rpc_error_maps_to_protocol() {
        let spec = shell_spec(
            r#"while read line; do printf '%s\n' '{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"boom"}}'; done"#,
        );
        let conn = StdioConnection::spawn("test", &spec, Duration::from_secs(5)).unwrap();
        let result = conn.request("tools/call", None).await;
        assert!(
            matches!(result, Err(StevedoreError::Protocol(_, msg)) if msg.contains("boom"))
        );
        conn.close().await;
    }

    #[tokio::test]
    async fn test_request_after_close_fails_fast() {
        let conn =
            StdioConnection::spawn("test", &responder_spec(), Duration::from_secs(5)).unwrap();
        conn.close().await;
        let result = conn.request("initialize", None).await;
        assert!(matches!(result, Err(StevedoreError::ConnectionClosed(_))));
    }
}
