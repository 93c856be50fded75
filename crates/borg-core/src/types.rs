use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Transport / Messaging ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Telegram,
    WhatsApp,
    Discord,
    Web,
}

impl Transport {
    /// The prefix used on `chat_id` values for this transport, e.g. "tg:123".
    pub fn prefix(&self) -> &'static str {
        match self {
            Transport::Telegram => "tg",
            Transport::WhatsApp => "wa",
            Transport::Discord => "discord",
            Transport::Web => "web",
        }
    }
}

/// A message normalized from any transport poller, ready for the store and
/// the chat orchestrator.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: String,
    /// Opaque transport-specific reference used to address a reply (e.g. a
    /// Telegram chat integer, a Discord channel ID).
    pub original_ref: String,
    pub message_id: String,
    pub sender: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub mentions_bot: bool,
    pub transport: Transport,
    pub chat_title: String,
    pub chat_type: String,
}

// ── Chat ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub chat_id: String,
    pub display_name: String,
    pub folder: String,
    pub trigger_phrase: String,
    pub requires_trigger: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub chat_id: String,
    pub message_id: String,
    pub sender_id: String,
    pub sender_display: String,
    pub body: String,
    pub timestamp: String,
    pub is_from_self: bool,
    pub is_bot_reply: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub folder: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

// ── Pipeline Task ────────────────────────────────────────────────────────

/// The pipeline status a task can be in. Terminal: Done, Merged, Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Spec,
    Qa,
    QaFix,
    Impl,
    Rebase,
    Retry,
    Test,
    Done,
    Merged,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Spec => "spec",
            TaskStatus::Qa => "qa",
            TaskStatus::QaFix => "qa_fix",
            TaskStatus::Impl => "impl",
            TaskStatus::Rebase => "rebase",
            TaskStatus::Retry => "retry",
            TaskStatus::Test => "test",
            TaskStatus::Done => "done",
            TaskStatus::Merged => "merged",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "backlog" => TaskStatus::Backlog,
            "spec" => TaskStatus::Spec,
            "qa" => TaskStatus::Qa,
            "qa_fix" => TaskStatus::QaFix,
            "impl" => TaskStatus::Impl,
            "rebase" => TaskStatus::Rebase,
            "retry" => TaskStatus::Retry,
            "test" => TaskStatus::Test,
            "done" => TaskStatus::Done,
            "merged" => TaskStatus::Merged,
            "failed" => TaskStatus::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Merged | TaskStatus::Failed)
    }

    /// `next_task` dispatch priority: lower sorts first.
    pub fn priority_weight(&self) -> u8 {
        match self {
            TaskStatus::Rebase => 0,
            TaskStatus::Retry => 1,
            TaskStatus::Impl => 2,
            TaskStatus::Qa | TaskStatus::QaFix => 3,
            TaskStatus::Spec => 4,
            TaskStatus::Backlog => 5,
            // Test and terminal statuses are not selected by next_task; the
            // driver reaches `test` as a direct consequence of running impl.
            TaskStatus::Test | TaskStatus::Done | TaskStatus::Merged | TaskStatus::Failed => 255,
        }
    }
}

/// A pipeline task as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub repo_path: String,
    pub branch: String,
    pub status: String,
    pub attempt: i64,
    pub max_attempts: i64,
    pub last_error: String,
    pub created_by: String,
    pub notify_chat: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

/// A pending integration-queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub task_id: i64,
    pub branch: String,
    pub repo_path: String,
    /// "queued" | "merging" | "merged" | "excluded" | "failed"
    pub status: String,
    pub queued_at: DateTime<Utc>,
    pub pr_number: i64,
}

/// A single persisted agent/test run for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub id: i64,
    pub task_id: i64,
    /// "seed" | "spec" | "qa" | "qa_fix" | "impl" | "rebase" | "test", or a
    /// `*_diff` sibling of one of those.
    pub phase: String,
    pub output: String,
    pub raw_stream: String,
    pub exit_code: i64,
    pub duration_ms: i64,
    pub success: bool,
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
}

/// Only the five canonical phases participate in `phase_metrics`.
pub const CANONICAL_PHASES: &[&str] = &["spec", "qa", "qa_fix", "impl", "rebase"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseMetrics {
    pub phase: String,
    pub attempts: i64,
    pub successes: i64,
    pub mean_duration_ms: f64,
    pub total_cost_usd: f64,
}

/// Broadcast to the dashboard/web layer whenever the pipeline makes progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PipelineEvent {
    Phase { task_id: Option<i64>, message: String },
    StatusChange { task_id: i64, status: String },
    Integration { task_id: i64, message: String },
}

// ── Config Types ─────────────────────────────────────────────────────────

/// Per-repository pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub path: String,
    pub test_cmd: String,
    /// Is this the primary self-hosted repo (triggers self-update on merge)?
    pub is_self: bool,
    /// Auto-merge queued branches when tests pass (false = manual merge mode).
    pub auto_merge: bool,
    pub lint_cmd: String,
}

// ── Store errors ─────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("backend error: {0}")]
    Backend(#[from] rusqlite::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ── Agent run contract ──────────────────────────────────────────────────

/// The outcome of one AgentSupervisor run, after NDJSON parsing.
#[derive(Debug, Clone, Default)]
pub struct AgentResult {
    pub output: String,
    pub raw_stream: String,
    pub new_session_id: Option<String>,
    pub cost_usd: f64,
    pub success: bool,
    pub exit_code: i32,
    pub duration_ms: i64,
}

impl AgentResult {
    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: false,
            ..Default::default()
        }
    }
}
