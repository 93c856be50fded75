use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

pub use crate::types::PipelineEvent;

use crate::{
    agent::AgentBackend,
    config::Config,
    db::Db,
    git::Git,
    prompt::{build_phase_instruction, Persona},
    stream::TaskStreamManager,
    types::Task,
};

/// Drives every non-terminal task through the lifecycle described in
/// SPEC_FULL §4.3: `backlog -> spec -> qa -> impl -> test`, with
/// `qa_fix`/`rebase`/`retry` looping back to `impl`.
pub struct Pipeline {
    pub db: Arc<Db>,
    pub backend: Arc<dyn AgentBackend>,
    pub config: Arc<Config>,
    pub event_tx: broadcast::Sender<PipelineEvent>,
    pub stream_manager: Arc<TaskStreamManager>,
    pub force_restart: Arc<std::sync::atomic::AtomicBool>,
    in_flight: Mutex<HashSet<i64>>,
    worktree_create_lock: Mutex<()>,
}

impl Pipeline {
    pub fn new(
        db: Arc<Db>,
        backend: Arc<dyn AgentBackend>,
        config: Arc<Config>,
        force_restart: Arc<std::sync::atomic::AtomicBool>,
    ) -> (Self, broadcast::Receiver<PipelineEvent>) {
        let (tx, rx) = broadcast::channel(256);
        let p = Self {
            db,
            backend,
            config,
            event_tx: tx,
            stream_manager: TaskStreamManager::new(),
            force_restart,
            in_flight: Mutex::new(HashSet::new()),
            worktree_create_lock: Mutex::new(()),
        };
        (p, rx)
    }

    pub fn active_agent_count(&self) -> usize {
        self.in_flight.try_lock().map(|g| g.len()).unwrap_or(0)
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.event_tx.send(event);
    }

    fn repo_config(&self, task: &Task) -> crate::types::RepoConfig {
        self.config
            .watched_repos
            .iter()
            .find(|r| r.path == task.repo_path)
            .cloned()
            .unwrap_or_else(|| crate::types::RepoConfig {
                path: task.repo_path.clone(),
                test_cmd: "make test".to_string(),
                is_self: false,
                auto_merge: true,
                lint_cmd: String::new(),
            })
    }

    fn session_dir(&self, task_id: i64) -> String {
        format!("{}/pipeline-sessions/task-{task_id}", self.config.data_dir)
    }

    fn worktree_path(&self, task: &Task) -> String {
        format!("{}/.worktrees/task-{}", task.repo_path, task.id)
    }

    /// Increment attempt and either move to `retry_status` or, if attempts
    /// are exhausted, fail the task and clean up its worktree.
    fn fail_or_retry(&self, task: &Task, retry_status: &str, error: &str) -> Result<()> {
        let attempt = self.db.increment_attempt(task.id)?;
        if attempt >= task.max_attempts {
            self.db.update_status(task.id, "failed")?;
            self.db.update_error(task.id, error)?;
            self.cleanup_worktree(task);
            self.emit(PipelineEvent::StatusChange { task_id: task.id, status: "failed".into() });
        } else {
            self.db.update_status(task.id, retry_status)?;
            self.db.update_error(task.id, error)?;
            self.emit(PipelineEvent::StatusChange { task_id: task.id, status: retry_status.into() });
        }
        Ok(())
    }

    fn cleanup_worktree(&self, task: &Task) {
        let wt_path = self.worktree_path(task);
        let git = Git::new(&task.repo_path);
        let _ = git.remove_worktree(&wt_path);
        std::fs::remove_dir_all(&wt_path).ok();
        let _ = git.exec(&task.repo_path, &["worktree", "prune"]);
        info!("cleaned up worktree {} for task #{}", wt_path, task.id);
    }

    fn git_coauthor(&self) -> Option<(String, String)> {
        if self.config.git_author_name.is_empty() {
            None
        } else {
            Some((self.config.git_author_name.clone(), self.config.git_author_email.clone()))
        }
    }

    fn with_user_coauthor(&self, message: &str) -> String {
        if self.config.git_user_coauthor.is_empty() {
            message.to_string()
        } else {
            format!("{message}\n\nCo-Authored-By: {}", self.config.git_user_coauthor)
        }
    }

    /// Latest persisted output (of any phase) for a task — the previous
    /// step's context fed into the next prompt.
    fn prior_output(&self, task_id: i64) -> String {
        self.db
            .outputs_for(task_id)
            .ok()
            .and_then(|outs| outs.into_iter().last())
            .map(|o| o.output)
            .unwrap_or_default()
    }

    // ── Main loop ─────────────────────────────────────────────────────────

    /// One pipeline tick (`pipeline_tick_s`, default 30s).
    pub async fn tick(self: Arc<Self>) -> Result<()> {
        if let Ok(n) = self.db.reset_stuck_queue_entries() {
            if n > 0 {
                info!("reset {n} stale merging queue entries to queued");
            }
        }
        if let Ok(n) = self.db.recycle_failed_tasks() {
            if n > 0 {
                info!("recycled {n} abandoned non-terminal tasks to retry");
            }
        }

        self.clone().process_one_integration().await.unwrap_or_else(|e| warn!("process_one_integration: {e}"));

        let tasks = self.db.list_active_tasks().context("list_active_tasks")?;
        let max_agents = self.config.max_pipeline_agents as usize;

        for task in tasks {
            let mut guard = self.in_flight.lock().await;
            if guard.len() >= max_agents {
                break;
            }
            if guard.contains(&task.id) {
                continue;
            }
            guard.insert(task.id);
            drop(guard);

            let pipeline = Arc::clone(&self);
            let task_id = task.id;
            tokio::spawn(async move {
                if let Err(e) = Arc::clone(&pipeline).process_task(task).await {
                    error!("process_task #{task_id} error: {e}");
                }
                pipeline.in_flight.lock().await.remove(&task_id);
            });
        }

        if self.force_restart.load(std::sync::atomic::Ordering::Acquire) {
            info!("force_restart flag set, pipeline loop exiting for self-update");
        }

        Ok(())
    }

    // ── Integration queue ────────────────────────────────────────────────

    /// Merges the single oldest queued branch into its repo's primary
    /// branch. On conflict the entry is excluded and the task returns to
    /// `rebase`.
    pub async fn process_one_integration(self: Arc<Self>) -> Result<()> {
        let entries = self.db.list_queued()?;
        let Some(entry) = entries.into_iter().next() else {
            return Ok(());
        };

        self.db.update_queue_status(entry.id, "merging")?;
        let git = Git::new(&entry.repo_path);
        let start = std::time::Instant::now();

        let merge_result = git.merge_delete(&entry.branch);
        let (success, error) = match &merge_result {
            Ok(()) => (true, String::new()),
            Err(e) => (false, e.to_string()),
        };

        if success {
            let task = self.db.get_task(entry.task_id)?;
            self.db.update_queue_status(entry.id, "merged")?;
            self.db.append_output(
                entry.task_id, "integration", "merged successfully", "",
                0, start.elapsed().as_millis() as i64, true, 0.0,
            )?;
            self.db.update_status(entry.task_id, "merged")?;
            self.emit(PipelineEvent::Integration { task_id: entry.task_id, message: format!("merged branch {}", entry.branch) });

            if let Some(task) = task {
                let repo = self.repo_config(&task);
                if repo.is_self {
                    self.db.set_kv("self_update_pending", "1")?;
                    self.force_restart.store(true, std::sync::atomic::Ordering::Release);
                    info!("self-hosted repo merged, self-update sentinel set");
                }
            }
            return Ok(());
        }

        let _ = git.abort_merge(&entry.repo_path);
        self.db.update_queue_status(entry.id, "excluded")?;
        self.db.append_output(
            entry.task_id, "integration", &error, &error,
            1, start.elapsed().as_millis() as i64, false, 0.0,
        )?;
        self.db.update_status(entry.task_id, "rebase")?;
        self.db.update_error(entry.task_id, &error)?;
        self.emit(PipelineEvent::Integration { task_id: entry.task_id, message: format!("merge conflict on {}, excluded", entry.branch) });
        warn!("integration merge conflict for task #{}: {error}", entry.task_id);

        Ok(())
    }

    // ── Task dispatch ─────────────────────────────────────────────────────

    async fn process_task(self: Arc<Self>, task: Task) -> Result<()> {
        info!("dispatching task #{} [{}] in {}: {}", task.id, task.status, task.repo_path, task.title);

        match task.status.as_str() {
            "backlog" => self.setup_branch(&task).await?,
            "spec" => self.run_phase(&task, Persona::Manager, "spec", "qa").await?,
            "qa" => self.run_phase(&task, Persona::Qa, "qa", "impl").await?,
            "qa_fix" | "retry" | "rebase" => self.run_impl_phase(&task).await?,
            "test" => self.run_test_phase(&task).await?,
            other => warn!("task #{} in unhandled status '{}'", task.id, other),
        }

        Ok(())
    }

    /// `backlog -> spec`: create the git worktree for the task's branch.
    async fn setup_branch(&self, task: &Task) -> Result<()> {
        let git = Git::new(&task.repo_path);
        let _ = git.fetch_origin();

        let branch = format!("task-{}", task.id);
        let wt_dir = format!("{}/.worktrees", task.repo_path);
        tokio::fs::create_dir_all(&wt_dir).await.ok();
        let wt_path = self.worktree_path(task);

        let _guard = self.worktree_create_lock.lock().await;
        let _ = git.remove_worktree(&wt_path);
        tokio::fs::remove_dir_all(&wt_path).await.ok();
        let _ = git.exec(&task.repo_path, &["worktree", "prune"]);
        let _ = git.exec(&task.repo_path, &["branch", "-D", &branch]);

        let result = git.exec(&task.repo_path, &["worktree", "add", &wt_path, "-b", &branch, "origin/main"])?;
        drop(_guard);

        if !result.success() {
            self.db.update_status(task.id, "failed")?;
            self.db.update_error(task.id, &result.stderr)?;
            return Ok(());
        }

        self.db.update_branch(task.id, &branch)?;
        self.db.update_status(task.id, "spec")?;
        info!("created worktree {} (branch {}) for task #{}", wt_path, branch, task.id);
        self.emit(PipelineEvent::Phase { task_id: Some(task.id), message: format!("task #{} started branch {}", task.id, branch) });
        Ok(())
    }

    /// Runs `spec -> qa` or `spec-context -> qa` style read-only planning
    /// phases that persist output and advance status without touching the
    /// working tree.
    async fn run_phase(&self, task: &Task, persona: Persona, phase_name: &str, next_status: &str) -> Result<()> {
        let wt_path = self.worktree_path(task);
        let session_dir = self.session_dir(task.id);
        tokio::fs::create_dir_all(&session_dir).await.ok();

        let git = Git::new(&wt_path);
        let file_listing = git.ls_files(&wt_path).ok();
        let prior = self.prior_output(task.id);
        let prompt = build_phase_instruction(persona, task, &prior, file_listing.as_deref());

        self.stream_manager.start(task.id).await;
        let task_id = task.id;
        // StreamCallback is sync (`Fn(&str)`), so chunks are handed to an
        // unbounded channel and drained by a single task in submission order
        // — spawning one task per chunk would let reads race and reorder the
        // live stream.
        let (chunk_tx, mut chunk_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let cb: crate::agent::StreamCallback = Box::new(move |s: &str| {
            let _ = chunk_tx.send(s.to_string());
        });
        let stream_manager = self.stream_manager.clone();
        let forward_task = tokio::spawn(async move {
            while let Some(line) = chunk_rx.recv().await {
                stream_manager.push_line(task_id, line).await;
            }
        });

        let session = self.db.get_session(&wt_path).ok().flatten();
        let result = self
            .backend
            .run(&wt_path, &session_dir, prompt.as_bytes(), session.as_ref().map(|s| s.session_id.as_str()), self.config.agent_timeout_s as u64, Some(cb))
            .await?;

        let _ = forward_task.await;
        self.stream_manager.end_task(task.id).await;
        self.db.append_output(task.id, phase_name, &result.output, &result.raw_stream, result.exit_code as i64, result.duration_ms, result.success, result.cost_usd)?;
        if let Some(sid) = &result.new_session_id {
            let _ = self.db.set_session(&wt_path, sid);
        }

        if !result.success {
            self.fail_or_retry(task, "retry", &result.output)?;
            return Ok(());
        }

        self.db.update_status(task.id, next_status)?;
        self.emit(PipelineEvent::StatusChange { task_id: task.id, status: next_status.into() });
        Ok(())
    }

    /// `qa | qa_fix | retry | rebase -> impl`: run the worker persona. A
    /// `rebase` dispatch first rebases the branch onto the primary branch so
    /// the worker resolves conflicts as part of its turn.
    async fn run_impl_phase(&self, task: &Task) -> Result<()> {
        let wt_path = self.worktree_path(task);
        let session_dir = self.session_dir(task.id);
        tokio::fs::create_dir_all(&session_dir).await.ok();

        let git = Git::new(&task.repo_path);
        if task.status == "rebase" {
            let _ = git.fetch_origin();
            if git.rebase_onto_main(&wt_path).is_err() {
                let _ = git.rebase_abort(&wt_path);
            }
        }

        let wtgit = Git::new(&wt_path);
        let file_listing = wtgit.ls_files(&wt_path).ok();
        let prior = self.prior_output(task.id);
        let prompt = build_phase_instruction(Persona::Worker, task, &prior, file_listing.as_deref());

        let session = self.db.get_session(&wt_path).ok().flatten();
        let result = self
            .backend
            .run(&wt_path, &session_dir, prompt.as_bytes(), session.as_ref().map(|s| s.session_id.as_str()), self.config.agent_timeout_s as u64, None)
            .await?;

        self.db.append_output(task.id, "impl", &result.output, &result.raw_stream, result.exit_code as i64, result.duration_ms, result.success, result.cost_usd)?;
        if let Some(sid) = &result.new_session_id {
            let _ = self.db.set_session(&wt_path, sid);
        }

        if !result.success {
            self.fail_or_retry(task, "retry", &result.output)?;
            return Ok(());
        }

        let author = self.git_coauthor();
        let message = self.with_user_coauthor(&format!("task #{}: {}", task.id, task.title));
        match wtgit.commit_all(&wt_path, &message, author.as_ref().map(|(n, e)| (n.as_str(), e.as_str()))) {
            Ok(true) => {
                self.db.update_status(task.id, "test")?;
                self.emit(PipelineEvent::StatusChange { task_id: task.id, status: "test".into() });
            }
            Ok(false) => {
                // Worker produced no diff: treat as a QA miss and loop back.
                self.fail_or_retry(task, "qa_fix", "worker produced no changes")?;
            }
            Err(e) => {
                self.fail_or_retry(task, "retry", &e.to_string())?;
            }
        }

        Ok(())
    }

    /// Runs the repo's configured test command inside the worktree.
    async fn run_test_phase(&self, task: &Task) -> Result<()> {
        let wt_path = self.worktree_path(task);
        let repo = self.repo_config(task);
        let start = std::time::Instant::now();

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&repo.test_cmd)
            .current_dir(&wt_path)
            .output()
            .await
            .context("failed to spawn test command")?;

        let duration_ms = start.elapsed().as_millis() as i64;
        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let success = output.status.success();
        let exit_code = output.status.code().unwrap_or(1) as i64;

        self.db.append_output(task.id, "test", &combined, &combined, exit_code, duration_ms, success, 0.0)?;

        if success {
            let branch = task.branch.clone();
            self.db.update_status(task.id, "done")?;
            self.db.enqueue_for_integration(task.id, &branch, &task.repo_path)?;
            self.emit(PipelineEvent::StatusChange { task_id: task.id, status: "done".into() });
            return Ok(());
        }

        let git = Git::new(&wt_path);
        let next_status = if git.rebase_in_progress(&wt_path).unwrap_or(false) {
            "rebase"
        } else {
            "qa_fix"
        };
        self.fail_or_retry(task, next_status, &combined)?;
        Ok(())
    }
}
