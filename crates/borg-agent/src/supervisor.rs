use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{info, warn};

use borg_core::agent::{AgentBackend, StreamCallback};
use borg_core::sandbox::{Sandbox, SandboxMode};
use borg_core::types::AgentResult;

use crate::event::parse_stream_into_result;

/// Per-stream cap enforced while draining stdout/stderr (saturating
/// truncation past this point, the child is not killed for exceeding it).
const MAX_STREAM_BYTES: usize = 16 * 1024 * 1024;
const STDOUT_CHUNK_BYTES: usize = 8 * 1024;

static RUN_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Runs Claude Code as a subprocess inside a sandbox, one container per
/// invocation.
pub struct ClaudeSupervisor {
    pub claude_bin: String,
    pub sandbox_mode: SandboxMode,
    pub docker_image: String,
    pub memory_mb: u64,
    pub model: String,
    pub oauth_token: String,
}

impl ClaudeSupervisor {
    pub fn new(
        claude_bin: impl Into<String>,
        sandbox_mode: SandboxMode,
        docker_image: impl Into<String>,
        memory_mb: u64,
        model: impl Into<String>,
        oauth_token: impl Into<String>,
    ) -> Self {
        Self {
            claude_bin: claude_bin.into(),
            sandbox_mode,
            docker_image: docker_image.into(),
            memory_mb,
            model: model.into(),
            oauth_token: oauth_token.into(),
        }
    }

    fn container_name() -> String {
        let n = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
        let pid = std::process::id();
        format!("borg-agent-{pid}-{n}")
    }
}

#[async_trait]
impl AgentBackend for ClaudeSupervisor {
    async fn run(
        &self,
        worktree_path: &str,
        session_dir: &str,
        stdin_bytes: &[u8],
        session_id: Option<&str>,
        timeout_s: u64,
        stream_cb: Option<StreamCallback>,
    ) -> Result<AgentResult> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--model".to_string(),
            self.model.clone(),
            "--verbose".to_string(),
            "--permission-mode".to_string(),
            "bypassPermissions".to_string(),
        ];
        if let Some(sid) = session_id.filter(|s| !s.is_empty()) {
            args.push("--resume".to_string());
            args.push(sid.to_string());
        }

        let name = Self::container_name();
        let mut full_cmd = vec![self.claude_bin.clone()];
        full_cmd.extend(args);

        for bind in [worktree_path, session_dir] {
            if let Err(e) = Sandbox::validate_bind(bind) {
                return Ok(AgentResult::failed(e));
            }
        }

        let mut child = match self.sandbox_mode {
            SandboxMode::Bwrap => {
                let writable = [worktree_path, session_dir];
                Sandbox::bwrap_command(&writable, worktree_path, &full_cmd)
                    .kill_on_drop(true)
                    .env("HOME", session_dir)
                    .env("CLAUDE_CODE_OAUTH_TOKEN", &self.oauth_token)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
                    .context("failed to spawn bwrap")?
            }
            SandboxMode::Docker => {
                let binds = [(worktree_path, worktree_path), (session_dir, session_dir)];
                Sandbox::docker_command(&self.docker_image, &binds, worktree_path, &full_cmd, self.memory_mb, &name)
                    .kill_on_drop(true)
                    .env("HOME", session_dir)
                    .env("CLAUDE_CODE_OAUTH_TOKEN", &self.oauth_token)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
                    .context("failed to spawn docker")?
            }
            SandboxMode::Direct => Command::new(&self.claude_bin)
                .args(&full_cmd[1..])
                .kill_on_drop(true)
                .current_dir(worktree_path)
                .env("HOME", session_dir)
                .env("CLAUDE_CODE_OAUTH_TOKEN", &self.oauth_token)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .with_context(|| format!("failed to spawn claude: {}", self.claude_bin))?,
        };

        let mut stdin = child.stdin.take().context("failed to take stdin")?;
        let stdout = child.stdout.take().context("failed to take stdout")?;
        let stderr = child.stderr.take().context("failed to take stderr")?;

        let stdin_bytes = stdin_bytes.to_vec();
        let writer = tokio::spawn(async move {
            let _ = stdin.write_all(&stdin_bytes).await;
            drop(stdin);
        });

        let stdout_task = tokio::spawn(async move { drain_stdout(stdout, stream_cb).await });
        let stderr_task = tokio::spawn(async move { drain_stderr(stderr).await });

        let start = std::time::Instant::now();
        let wait = async {
            let _ = writer.await;
            let status = child.wait().await;
            // Reader tasks are always joined, win or lose, per the concurrent
            // drain contract — a timeout path below does the same.
            let stdout_buf = stdout_task.await.unwrap_or_default();
            let stderr_buf = stderr_task.await.unwrap_or_default();
            (status, stdout_buf, stderr_buf)
        };

        let (status, raw_stream, stderr_buf) = if timeout_s > 0 {
            match tokio::time::timeout(std::time::Duration::from_secs(timeout_s), wait).await {
                Ok(v) => v,
                Err(_) => {
                    warn!(name = %name, timeout_s, "agent run timed out, killing container");
                    if matches!(self.sandbox_mode, SandboxMode::Docker) {
                        Sandbox::docker_kill(&name).await;
                    }
                    let _ = child.start_kill();
                    let status = child.wait().await;
                    return Ok(AgentResult {
                        success: false,
                        duration_ms: start.elapsed().as_millis() as i64,
                        exit_code: status.ok().and_then(|s| s.code()).unwrap_or(-1),
                        ..AgentResult::failed("agent timed out")
                    });
                }
            }
        } else {
            wait.await
        };

        let exit_code = status.as_ref().ok().and_then(|s| s.code()).unwrap_or(-1);
        let duration_ms = start.elapsed().as_millis() as i64;

        if !stderr_buf.is_empty() {
            warn!(name = %name, "agent stderr: {}", stderr_buf.trim_end());
        }

        let mut result = parse_stream_into_result(&raw_stream, exit_code, duration_ms);
        result.success = result.success && status.map(|s| s.success()).unwrap_or(false);

        info!(
            name = %name,
            exit_code,
            duration_ms,
            success = result.success,
            "agent run finished"
        );

        Ok(result)
    }

    async fn cancel(&self, name: &str) {
        if matches!(self.sandbox_mode, SandboxMode::Docker) {
            Sandbox::docker_kill(name).await;
        }
    }
}

/// Reads stdout to completion, forwarding at-most-8KiB chunks to `stream_cb`
/// and accumulating the full (capped) stream for NDJSON parsing.
async fn drain_stdout(
    mut stdout: impl tokio::io::AsyncRead + Unpin,
    stream_cb: Option<StreamCallback>,
) -> String {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; STDOUT_CHUNK_BYTES];
    loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        if let Some(cb) = &stream_cb {
            if let Ok(s) = std::str::from_utf8(&chunk[..n]) {
                cb(s);
            }
        }
        if buf.len() < MAX_STREAM_BYTES {
            let remaining = MAX_STREAM_BYTES - buf.len();
            buf.extend_from_slice(&chunk[..n.min(remaining)]);
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Reads stderr to completion on its own task — this is what makes the
/// supervisor safe against the classic pipe-buffer deadlock where a chatty
/// stderr fills its OS buffer while nobody is reading it.
async fn drain_stderr(mut stderr: impl tokio::io::AsyncRead + Unpin) -> String {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; STDOUT_CHUNK_BYTES];
    loop {
        let n = match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        if buf.len() < MAX_STREAM_BYTES {
            let remaining = MAX_STREAM_BYTES - buf.len();
            buf.extend_from_slice(&chunk[..n.min(remaining)]);
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_stdout_forwards_chunks_and_accumulates() {
        let data = b"hello world".to_vec();
        let cursor = std::io::Cursor::new(data);
        let seen = std::sync::Arc::new(std::sync::Mutex::new(String::new()));
        let seen2 = seen.clone();
        let cb: StreamCallback = Box::new(move |s| seen2.lock().unwrap().push_str(s));
        let out = drain_stdout(cursor, Some(cb)).await;
        assert_eq!(out, "hello world");
        assert_eq!(*seen.lock().unwrap(), "hello world");
    }

    #[test]
    fn validate_bind_rejects_traversal_and_ssh() {
        assert!(Sandbox::validate_bind("/home/user/../etc:/etc").is_err());
        assert!(Sandbox::validate_bind("/root/.ssh:/mnt").is_err());
        assert!(Sandbox::validate_bind("/srv/repo:/work").is_ok());
    }
}
