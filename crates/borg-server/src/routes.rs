use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{delete, get, post},
    Router,
};
use borg_core::{
    config::Config,
    db::Db,
    pipeline::{Pipeline, PipelineEvent},
    types::{IncomingMessage, Message, Transport},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tokio_stream::StreamExt;
use tower_http::services::{ServeDir, ServeFile};

/// Shared handle reachable from every route handler.
pub struct AppState {
    pub config: Config,
    pub db: Arc<Db>,
    pub pipeline: Arc<Pipeline>,
    /// Normalizes dashboard chat posts into the same `IncomingMessage` shape
    /// every other transport produces; `IntegratorMain` drains this channel
    /// on its tick exactly like it polls Telegram/Discord/the sidecar.
    pub web_tx: mpsc::UnboundedSender<IncomingMessage>,
    pub chat_event_tx: broadcast::Sender<String>,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: Arc<StdMutex<VecDeque<String>>>,
    pub start_time: Instant,
}

pub fn router(state: Arc<AppState>) -> Router {
    let dashboard = ServeDir::new(&state.config.dashboard_dist_dir)
        .fallback(ServeFile::new(format!("{}/index.html", state.config.dashboard_dist_dir)));

    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(get_status))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/:id", get(get_task).delete(delete_task))
        .route("/api/queue", get(list_queue))
        .route("/api/release", post(post_release))
        .route("/api/chat", post(post_chat))
        .route("/api/chat/stream", get(sse_chat))
        .route("/api/logs", get(sse_logs))
        .with_state(state)
        .fallback_service(dashboard)
}

fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ── Tasks ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateTaskBody {
    title: String,
    description: Option<String>,
    repo_path: Option<String>,
    max_attempts: Option<i64>,
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let tasks = state.db.list_all_tasks().map_err(internal)?;
    Ok(Json(json!(tasks)))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    let task = state.db.get_task(id).map_err(internal)?.ok_or(StatusCode::NOT_FOUND)?;
    let outputs = state.db.outputs_for(id).map_err(internal)?;
    let mut v = serde_json::to_value(&task).map_err(internal)?;
    if let Some(obj) = v.as_object_mut() {
        obj.insert("outputs".into(), serde_json::to_value(outputs).map_err(internal)?);
    }
    Ok(Json(v))
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTaskBody>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let repo_path = body
        .repo_path
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| state.config.pipeline_repo.clone());
    let id = state
        .db
        .create_task(
            &body.title,
            body.description.as_deref().unwrap_or(""),
            &repo_path,
            "api",
            "",
            body.max_attempts.unwrap_or(5),
        )
        .map_err(internal)?;
    let _ = state.pipeline.event_tx.send(PipelineEvent::StatusChange { task_id: id, status: "backlog".into() });
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, StatusCode> {
    state.db.get_task(id).map_err(internal)?.ok_or(StatusCode::NOT_FOUND)?;
    state.db.delete_task(id).map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_queue(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let entries = state.db.list_queued().map_err(internal)?;
    Ok(Json(json!(entries)))
}

// ── Status ───────────────────────────────────────────────────────────────

async fn get_status(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let uptime_s = state.start_time.elapsed().as_secs();
    let tasks = state.db.list_all_tasks().map_err(internal)?;
    let total = tasks.len();
    let merged = tasks.iter().filter(|t| t.status == "merged").count();
    let failed = tasks.iter().filter(|t| t.status == "failed").count();
    let active = total - merged - failed - tasks.iter().filter(|t| t.status == "done").count();

    let watched_repos: Vec<Value> = state
        .config
        .watched_repos
        .iter()
        .map(|r| {
            json!({
                "path": r.path,
                "test_cmd": r.test_cmd,
                "is_self": r.is_self,
                "auto_merge": r.auto_merge,
            })
        })
        .collect();

    let metrics = state.db.phase_metrics().map_err(internal)?;

    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_s": uptime_s,
        "model": state.config.model,
        "assistant_name": state.config.assistant_name,
        "watched_repos": watched_repos,
        "release_interval_mins": state.config.release_interval_mins,
        "continuous_mode": state.config.continuous_mode,
        "active_tasks": active,
        "merged_tasks": merged,
        "failed_tasks": failed,
        "total_tasks": total,
        "dispatched_agents": state.pipeline.active_agent_count(),
        "phase_metrics": metrics,
    })))
}

// ── Release ──────────────────────────────────────────────────────────────

async fn post_release(State(state): State<Arc<AppState>>) -> Json<Value> {
    let pipeline = Arc::clone(&state.pipeline);
    tokio::spawn(async move {
        if let Err(e) = pipeline.process_one_integration().await {
            tracing::warn!("manual /api/release integration pass failed: {e}");
        }
    });
    tracing::info!("integration pass requested via /api/release");
    Json(json!({ "ok": true }))
}

// ── Chat ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ChatPostBody {
    text: String,
    sender: Option<String>,
}

async fn post_chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatPostBody>,
) -> Result<Json<Value>, StatusCode> {
    let sender = body.sender.unwrap_or_else(|| "dashboard".to_string());
    let now = Utc::now();

    let msg = Message {
        chat_id: "web:dashboard".to_string(),
        message_id: format!("web-{}", now.timestamp_millis()),
        sender_id: sender.clone(),
        sender_display: sender.clone(),
        body: body.text.clone(),
        timestamp: now.format("%Y-%m-%d %H:%M:%S").to_string(),
        is_from_self: false,
        is_bot_reply: false,
    };
    state.db.store_message(&msg).map_err(internal)?;

    let event = json!({
        "role": "user",
        "sender": sender,
        "text": body.text,
        "ts": now.timestamp(),
    })
    .to_string();
    let _ = state.chat_event_tx.send(event);

    let incoming = IncomingMessage {
        chat_id: "web:dashboard".to_string(),
        original_ref: "web:dashboard".to_string(),
        message_id: msg.message_id,
        sender: msg.sender_id,
        sender_name: sender,
        text: msg.body,
        timestamp: now,
        mentions_bot: true,
        transport: Transport::Web,
        chat_title: "Dashboard".to_string(),
        chat_type: "private".to_string(),
    };
    let _ = state.web_tx.send(incoming);

    Ok(Json(json!({ "ok": true })))
}

async fn sse_chat(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.chat_event_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(data) => Some(Ok(Event::default().data(data))),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)).text("ping"))
}

// ── Logs ─────────────────────────────────────────────────────────────────

async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let live_rx = state.log_tx.subscribe();
    let history: Vec<String> = state
        .log_ring
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect();

    tokio::spawn(async move {
        for line in history {
            if tx.send(line).is_err() {
                return;
            }
        }
        let mut live_rx = live_rx;
        loop {
            match live_rx.recv().await {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });

    let stream = UnboundedReceiverStream::new(rx).map(|data| Ok::<_, std::convert::Infallible>(Event::default().data(data)));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)).text("ping"))
}
