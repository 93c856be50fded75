use anyhow::Result;
use async_trait::async_trait;

use crate::types::AgentResult;

/// Callback invoked with each stdout chunk (at most 8 KiB) as it is read, so
/// a caller can forward it to a live NDJSON stream subscriber before the
/// agent finishes.
pub type StreamCallback = Box<dyn Fn(&str) + Send + Sync>;

/// One invocation of a sandboxed coding agent.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Runs the agent against `stdin_bytes` (the assembled prompt) inside
    /// `worktree_path`, honouring `timeout_s` (0 = no limit). `session_dir`
    /// is bind-mounted read-write so the agent's own state/credentials
    /// directory persists across runs of the same chat or task.
    async fn run(
        &self,
        worktree_path: &str,
        session_dir: &str,
        stdin_bytes: &[u8],
        session_id: Option<&str>,
        timeout_s: u64,
        stream_cb: Option<StreamCallback>,
    ) -> Result<AgentResult>;

    /// Asks the runtime to kill an in-flight invocation by its deterministic
    /// container name. Best-effort; the caller still joins the reader tasks.
    async fn cancel(&self, name: &str);
}
