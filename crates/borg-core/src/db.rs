use std::sync::Mutex;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::types::{
    AgentSession, Chat, Message, PhaseMetrics, QueueEntry, StoreError, StoreResult, Task,
    TaskOutput, CANONICAL_PHASES,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

pub struct Db {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn now_str() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        chat_id: row.get(0)?,
        display_name: row.get(1)?,
        folder: row.get(2)?,
        trigger_phrase: row.get(3)?,
        requires_trigger: row.get::<_, i64>(4)? != 0,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        chat_id: row.get(0)?,
        message_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_display: row.get(3)?,
        body: row.get(4)?,
        timestamp: row.get(5)?,
        is_from_self: row.get::<_, i64>(6)? != 0,
        is_bot_reply: row.get::<_, i64>(7)? != 0,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let created_at_str: String = row.get(10)?;
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        repo_path: row.get(3)?,
        branch: row.get(4)?,
        status: row.get(5)?,
        attempt: row.get(6)?,
        max_attempts: row.get(7)?,
        last_error: row.get(8)?,
        created_by: row.get(9)?,
        created_at: parse_ts(&created_at_str),
        notify_chat: row.get(11)?,
        session_id: row.get(12)?,
    })
}

fn row_to_output(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskOutput> {
    let created_at_str: String = row.get(9)?;
    Ok(TaskOutput {
        id: row.get(0)?,
        task_id: row.get(1)?,
        phase: row.get(2)?,
        output: row.get(3)?,
        raw_stream: row.get(4)?,
        exit_code: row.get(5)?,
        duration_ms: row.get(6)?,
        success: row.get::<_, i64>(7)? != 0,
        cost_usd: row.get(8)?,
        created_at: parse_ts(&created_at_str),
    })
}

fn row_to_queue_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueEntry> {
    let queued_at_str: String = row.get(5)?;
    Ok(QueueEntry {
        id: row.get(0)?,
        task_id: row.get(1)?,
        branch: row.get(2)?,
        repo_path: row.get(3)?,
        status: row.get(4)?,
        queued_at: parse_ts(&queued_at_str),
        pr_number: row.get(6)?,
    })
}

impl Db {
    pub fn open(path: &str) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Chats ────────────────────────────────────────────────────────────

    pub fn register_chat(&self, chat: &Chat) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let existing: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM chats WHERE chat_id = ?1",
                params![chat.chat_id],
                |r| r.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(StoreError::ConstraintViolation(format!(
                "chat {} already registered",
                chat.chat_id
            )));
        }
        conn.execute(
            "INSERT INTO chats (chat_id, display_name, folder, trigger_phrase, requires_trigger)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                chat.chat_id,
                chat.display_name,
                chat.folder,
                chat.trigger_phrase,
                chat.requires_trigger as i64,
            ],
        )?;
        Ok(())
    }

    pub fn unregister_chat(&self, chat_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM chats WHERE chat_id = ?1", params![chat_id])?;
        Ok(())
    }

    pub fn get_chat(&self, chat_id: &str) -> StoreResult<Option<Chat>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT chat_id, display_name, folder, trigger_phrase, requires_trigger
             FROM chats WHERE chat_id = ?1",
            params![chat_id],
            row_to_chat,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn list_chats(&self) -> StoreResult<Vec<Chat>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT chat_id, display_name, folder, trigger_phrase, requires_trigger FROM chats",
        )?;
        let rows = stmt.query_map([], row_to_chat)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
    }

    // ── Messages ─────────────────────────────────────────────────────────

    /// Ignore-on-conflict insert: the first write for a given
    /// `(chat_id, message_id)` wins.
    pub fn store_message(&self, msg: &Message) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO messages
                (chat_id, message_id, sender_id, sender_display, body, timestamp, is_from_self, is_bot_reply)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                msg.chat_id,
                msg.message_id,
                msg.sender_id,
                msg.sender_display,
                msg.body,
                msg.timestamp,
                msg.is_from_self as i64,
                msg.is_bot_reply as i64,
            ],
        )?;
        Ok(())
    }

    pub fn messages_since(&self, chat_id: &str, ts_exclusive: &str) -> StoreResult<Vec<Message>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT chat_id, message_id, sender_id, sender_display, body, timestamp, is_from_self, is_bot_reply
             FROM messages
             WHERE chat_id = ?1 AND timestamp > ?2
             ORDER BY timestamp ASC
             LIMIT 50",
        )?;
        let rows = stmt.query_map(params![chat_id, ts_exclusive], row_to_message)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
    }

    // ── Agent sessions ───────────────────────────────────────────────────

    pub fn get_session(&self, folder: &str) -> StoreResult<Option<AgentSession>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT folder, session_id, created_at FROM agent_sessions WHERE folder = ?1",
            params![folder],
            |row| {
                let created_at_str: String = row.get(2)?;
                Ok(AgentSession {
                    folder: row.get(0)?,
                    session_id: row.get(1)?,
                    created_at: parse_ts(&created_at_str),
                })
            },
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn set_session(&self, folder: &str, session_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO agent_sessions (folder, session_id, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(folder) DO UPDATE SET session_id = excluded.session_id, created_at = excluded.created_at",
            params![folder, session_id, now_str()],
        )?;
        Ok(())
    }

    pub fn expire_sessions(&self, max_hours: i64) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = (Utc::now() - chrono::Duration::hours(max_hours))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        let n = conn.execute(
            "DELETE FROM agent_sessions WHERE created_at < ?1",
            params![cutoff],
        )?;
        Ok(n)
    }

    // ── Pipeline tasks ───────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_task(
        &self,
        title: &str,
        description: &str,
        repo_path: &str,
        created_by: &str,
        notify_chat: &str,
        max_attempts: i64,
    ) -> StoreResult<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO pipeline_tasks
                (title, description, repo_path, branch, status, attempt, max_attempts,
                 last_error, created_by, notify_chat, session_id, created_at)
             VALUES (?1, ?2, ?3, '', 'backlog', 0, ?4, '', ?5, ?6, '', ?7)",
            params![title, description, repo_path, max_attempts, created_by, notify_chat, now_str()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_task(&self, id: i64) -> StoreResult<Option<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT id, title, description, repo_path, branch, status, attempt, max_attempts,
                    last_error, created_by, created_at, notify_chat, session_id
             FROM pipeline_tasks WHERE id = ?1",
            params![id],
            row_to_task,
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn list_active_tasks(&self) -> StoreResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, title, description, repo_path, branch, status, attempt, max_attempts,
                    last_error, created_by, created_at, notify_chat, session_id
             FROM pipeline_tasks
             WHERE status NOT IN ('done', 'merged', 'failed')",
        )?;
        let rows = stmt.query_map([], row_to_task)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
    }

    pub fn list_all_tasks(&self) -> StoreResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, title, description, repo_path, branch, status, attempt, max_attempts,
                    last_error, created_by, created_at, notify_chat, session_id
             FROM pipeline_tasks ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], row_to_task)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
    }

    /// The next task to dispatch, by `(priority_weight, created_at, id)`.
    pub fn next_task(&self) -> StoreResult<Option<Task>> {
        let active = self.list_active_tasks()?;
        let mut candidates: Vec<&Task> = active
            .iter()
            .filter(|t| {
                crate::types::TaskStatus::from_str(&t.status)
                    .map(|s| s.priority_weight() != 255)
                    .unwrap_or(false)
            })
            .collect();
        candidates.sort_by(|a, b| {
            let wa = crate::types::TaskStatus::from_str(&a.status)
                .map(|s| s.priority_weight())
                .unwrap_or(255);
            let wb = crate::types::TaskStatus::from_str(&b.status)
                .map(|s| s.priority_weight())
                .unwrap_or(255);
            wa.cmp(&wb)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(candidates.into_iter().next().cloned())
    }

    pub fn update_status(&self, id: i64, status: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE pipeline_tasks SET status = ?1 WHERE id = ?2",
            params![status, id],
        )?;
        Ok(())
    }

    pub fn update_branch(&self, id: i64, branch: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE pipeline_tasks SET branch = ?1 WHERE id = ?2",
            params![branch, id],
        )?;
        Ok(())
    }

    pub fn update_error(&self, id: i64, error: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE pipeline_tasks SET last_error = ?1 WHERE id = ?2",
            params![error, id],
        )?;
        Ok(())
    }

    pub fn set_session_id(&self, id: i64, session_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE pipeline_tasks SET session_id = ?1 WHERE id = ?2",
            params![session_id, id],
        )?;
        Ok(())
    }

    /// Increments `attempt` and returns the new value.
    pub fn increment_attempt(&self, id: i64) -> StoreResult<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE pipeline_tasks SET attempt = attempt + 1 WHERE id = ?1",
            params![id],
        )?;
        conn.query_row(
            "SELECT attempt FROM pipeline_tasks WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )
        .map_err(StoreError::from)
    }

    pub fn delete_task(&self, id: i64) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM pipeline_tasks WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ── Task outputs ─────────────────────────────────────────────────────

    /// Full form: truncates `output` to 32000 bytes, stores `raw` verbatim.
    #[allow(clippy::too_many_arguments)]
    pub fn append_output(
        &self,
        task_id: i64,
        phase: &str,
        output: &str,
        raw: &str,
        exit_code: i64,
        duration_ms: i64,
        success: bool,
        cost_usd: f64,
    ) -> StoreResult<i64> {
        const MAX_OUTPUT_BYTES: usize = 32_000;
        let truncated = truncate_utf8(output, MAX_OUTPUT_BYTES);
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO task_outputs
                (task_id, phase, output, raw_stream, exit_code, duration_ms, success, cost_usd, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                task_id,
                phase,
                truncated,
                raw,
                exit_code,
                duration_ms,
                success as i64,
                cost_usd,
                now_str(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Legacy short form: `raw="", duration_ms=0, success=true, cost_usd=0.0`.
    pub fn append_output_legacy(&self, task_id: i64, phase: &str, output: &str, exit_code: i64) -> StoreResult<i64> {
        self.append_output(task_id, phase, output, "", exit_code, 0, true, 0.0)
    }

    pub fn mark_output_success(&self, output_id: i64, success: bool) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE task_outputs SET success = ?1 WHERE id = ?2",
            params![success as i64, output_id],
        )?;
        Ok(())
    }

    pub fn outputs_for(&self, task_id: i64) -> StoreResult<Vec<TaskOutput>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, task_id, phase, output, raw_stream, exit_code, duration_ms, success, cost_usd, created_at
             FROM task_outputs WHERE task_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![task_id], row_to_output)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
    }

    /// Per-phase aggregate metrics, restricted to the canonical phase names.
    /// The mean excludes zero-duration (legacy) rows but counts them in
    /// `attempts`; if every row for a phase is zero-duration, mean is 0.0.
    pub fn phase_metrics(&self) -> StoreResult<Vec<PhaseMetrics>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        for phase in CANONICAL_PHASES {
            let mut stmt = conn.prepare(
                "SELECT duration_ms, success, cost_usd FROM task_outputs WHERE phase = ?1",
            )?;
            let rows: Vec<(i64, i64, f64)> = stmt
                .query_map(params![phase], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let attempts = rows.len() as i64;
            let successes = rows.iter().filter(|(_, s, _)| *s != 0).count() as i64;
            let total_cost_usd: f64 = rows.iter().map(|(_, _, c)| c).sum();
            let nonzero: Vec<i64> = rows.iter().map(|(d, _, _)| *d).filter(|d| *d > 0).collect();
            let mean_duration_ms = if nonzero.is_empty() {
                0.0
            } else {
                nonzero.iter().sum::<i64>() as f64 / nonzero.len() as f64
            };
            out.push(PhaseMetrics {
                phase: phase.to_string(),
                attempts,
                successes,
                mean_duration_ms,
                total_cost_usd,
            });
        }
        Ok(out)
    }

    // ── Integration queue ────────────────────────────────────────────────

    /// Replaces any existing `queued` entry for the same task.
    pub fn enqueue_for_integration(&self, task_id: i64, branch: &str, repo_path: &str) -> StoreResult<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "DELETE FROM queue_entries WHERE task_id = ?1 AND status = 'queued'",
            params![task_id],
        )?;
        conn.execute(
            "INSERT INTO queue_entries (task_id, branch, repo_path, status, queued_at, pr_number)
             VALUES (?1, ?2, ?3, 'queued', ?4, 0)",
            params![task_id, branch, repo_path, now_str()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_queued(&self) -> StoreResult<Vec<QueueEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, task_id, branch, repo_path, status, queued_at, pr_number
             FROM queue_entries WHERE status = 'queued' ORDER BY queued_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], row_to_queue_entry)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
    }

    pub fn list_queued_for_repo(&self, repo_path: &str) -> StoreResult<Vec<QueueEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, task_id, branch, repo_path, status, queued_at, pr_number
             FROM queue_entries WHERE repo_path = ?1 ORDER BY queued_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![repo_path], row_to_queue_entry)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StoreError::from)
    }

    pub fn update_queue_status(&self, id: i64, status: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE queue_entries SET status = ?1 WHERE id = ?2",
            params![status, id],
        )?;
        Ok(())
    }

    pub fn update_queue_pr(&self, id: i64, pr_number: i64) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE queue_entries SET pr_number = ?1 WHERE id = ?2",
            params![pr_number, id],
        )?;
        Ok(())
    }

    /// Crash recovery: any entry left `merging` at shutdown reverts to `queued`.
    pub fn reset_stuck_queue_entries(&self) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn.execute(
            "UPDATE queue_entries SET status = 'queued' WHERE status = 'merging'",
            [],
        )?;
        Ok(n)
    }

    /// Crash recovery: tasks abandoned in a non-terminal phase with attempts
    /// remaining revert to `retry`.
    pub fn recycle_failed_tasks(&self) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn.execute(
            "UPDATE pipeline_tasks
             SET status = 'retry'
             WHERE status NOT IN ('backlog', 'done', 'merged', 'failed', 'retry')
               AND attempt < max_attempts",
            [],
        )?;
        Ok(n)
    }

    // ── KV state ─────────────────────────────────────────────────────────

    pub fn get_kv(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT value FROM kv_state WHERE key = ?1",
            params![key],
            |r| r.get(0),
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn set_kv(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO kv_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_kv(&self, key: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM kv_state WHERE key = ?1", params![key])?;
        Ok(())
    }
}

/// Truncates a string to at most `max_bytes` bytes without splitting a UTF-8
/// code point.
fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Db {
        Db::open_in_memory().expect("open in-memory db")
    }

    #[test]
    fn store_message_ignores_duplicate() {
        let db = test_db();
        db.register_chat(&Chat {
            chat_id: "tg:1".into(),
            display_name: "Test".into(),
            folder: "test".into(),
            trigger_phrase: "@Borg".into(),
            requires_trigger: true,
        })
        .unwrap();
        let msg = Message {
            chat_id: "tg:1".into(),
            message_id: "m1".into(),
            sender_id: "u1".into(),
            sender_display: "User".into(),
            body: "hello".into(),
            timestamp: "2026-01-01 00:00:00".into(),
            is_from_self: false,
            is_bot_reply: false,
        };
        db.store_message(&msg).unwrap();
        let mut dup = msg.clone();
        dup.body = "different".into();
        db.store_message(&dup).unwrap();
        let rows = db.messages_since("tg:1", "1970-01-01 00:00:00").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].body, "hello");
    }

    #[test]
    fn append_output_truncates_but_keeps_raw() {
        let db = test_db();
        let task_id = db.create_task("t", "d", "/repo", "tester", "", 5).unwrap();
        let big = "x".repeat(40_000);
        let id = db
            .append_output(task_id, "impl", &big, &big, 0, 100, true, 0.25)
            .unwrap();
        let outs = db.outputs_for(task_id).unwrap();
        let out = outs.iter().find(|o| o.id == id).unwrap();
        assert_eq!(out.output.len(), 32_000);
        assert_eq!(out.raw_stream.len(), 40_000);
    }

    #[test]
    fn phase_metrics_excludes_zero_duration_from_mean() {
        let db = test_db();
        let task_id = db.create_task("t", "d", "/repo", "tester", "", 5).unwrap();
        db.append_output(task_id, "impl", "a", "a", 0, 0, true, 0.0).unwrap();
        db.append_output(task_id, "impl", "b", "b", 0, 200, true, 0.0).unwrap();
        let metrics = db.phase_metrics().unwrap();
        let m = metrics.iter().find(|m| m.phase == "impl").unwrap();
        assert_eq!(m.attempts, 2);
        assert_eq!(m.mean_duration_ms, 200.0);
    }

    #[test]
    fn next_task_orders_by_priority_then_age() {
        let db = test_db();
        let backlog = db.create_task("b", "d", "/repo", "t", "", 5).unwrap();
        let impl_task = db.create_task("i", "d", "/repo", "t", "", 5).unwrap();
        db.update_status(impl_task, "impl").unwrap();
        let next = db.next_task().unwrap().unwrap();
        assert_eq!(next.id, impl_task);
        db.update_status(impl_task, "done").unwrap();
        let next = db.next_task().unwrap().unwrap();
        assert_eq!(next.id, backlog);
    }

    #[test]
    fn enqueue_replaces_existing_queued_entry() {
        let db = test_db();
        let task_id = db.create_task("t", "d", "/repo", "tester", "", 5).unwrap();
        db.enqueue_for_integration(task_id, "b1", "/repo").unwrap();
        db.enqueue_for_integration(task_id, "b2", "/repo").unwrap();
        let queued = db.list_queued_for_repo("/repo").unwrap();
        let still_queued: Vec<_> = queued.iter().filter(|q| q.status == "queued").collect();
        assert_eq!(still_queued.len(), 1);
        assert_eq!(still_queued[0].branch, "b2");
    }
}
