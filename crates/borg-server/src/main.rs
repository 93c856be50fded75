mod logging;
mod routes;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use borg_agent::ClaudeSupervisor;
use borg_core::agent::AgentBackend;
use borg_core::chat::{AdmissionConfig, ChatOrchestrator, Outcome};
use borg_core::config::Config;
use borg_core::db::Db;
use borg_core::discord::{Discord, DiscordMessage};
use borg_core::pipeline::Pipeline;
use borg_core::prompt::build_chat_instruction;
use borg_core::sandbox::Sandbox;
use borg_core::sidecar::{Sidecar, SidecarEvent};
use borg_core::telegram::{TgMessage, Telegram};
use borg_core::types::{Chat, IncomingMessage, Message, Task, Transport};

use logging::BroadcastLayer;
use routes::AppState;

/// Main tick cadence. Every transport drains into `inbound_rx` on its own
/// task; the tick loop here only advances the chat state machine and the
/// session-expiry sweep, so it never blocks on network I/O.
const POLL_INTERVAL_MS: u64 = 500;
/// ~60 ticks at 500ms is once a minute.
const SESSION_EXPIRY_TICKS: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("loading configuration")?;

    let (log_tx, _) = broadcast::channel::<String>(1024);
    let log_ring = Arc::new(StdMutex::new(std::collections::VecDeque::new()));
    let broadcast_layer = BroadcastLayer {
        tx: log_tx.clone(),
        ring: log_ring.clone(),
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("borg_server=info,borg_core=info,borg_agent=info,tower_http=warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(broadcast_layer)
        .init();

    if config.telegram_token.is_empty() && config.discord_token.is_empty() && config.wa_disabled {
        warn!("no chat transport is configured (Telegram/Discord/WhatsApp all disabled) - only the web dashboard will be reachable");
    }

    std::fs::create_dir_all(&config.data_dir).context("creating data dir")?;
    let sessions_dir = format!("{}/sessions", config.data_dir);
    std::fs::create_dir_all(&sessions_dir).context("creating sessions dir")?;
    std::fs::create_dir_all(format!("{}/ipc", config.data_dir)).context("creating ipc dir")?;

    let db = Arc::new(Db::open(&format!("{}/borg.db", config.data_dir)).context("opening store")?);

    // Crash recovery: anything left mid-merge or mid-phase from a previous,
    // ungracefully-terminated run gets put back in a dispatchable state.
    // `pipeline.tick()` repeats both calls every tick, so this is belt and
    // suspenders, not load-bearing.
    let _ = db.reset_stuck_queue_entries();
    let _ = db.recycle_failed_tasks();

    let sandbox_mode = Sandbox::detect(&config.sandbox_backend).await;
    info!(?sandbox_mode, "sandbox backend selected");
    let backend: Arc<dyn AgentBackend> = Arc::new(ClaudeSupervisor::new(
        "claude",
        sandbox_mode,
        config.container_image.clone(),
        config.container_memory_mb,
        config.model.clone(),
        config.oauth_token.clone(),
    ));

    let config = Arc::new(config);
    let shutdown = Arc::new(AtomicBool::new(false));
    let force_restart = Arc::new(AtomicBool::new(false));

    let (pipeline, _pipeline_events) = Pipeline::new(db.clone(), backend.clone(), config.clone(), force_restart.clone());
    let pipeline = Arc::new(pipeline);

    let pipeline_handle = {
        let pipeline = pipeline.clone();
        let force_restart = force_restart.clone();
        let shutdown = shutdown.clone();
        let tick_every = Duration::from_secs(config.pipeline_tick_s.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick_every).await;
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = pipeline.clone().tick().await {
                    warn!("pipeline tick failed: {e}");
                }
                if force_restart.load(Ordering::Acquire) {
                    break;
                }
            }
        })
    };

    let orchestrator = ChatOrchestrator::new();

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<IncomingMessage>();

    let telegram = spawn_telegram(&config, inbound_tx.clone()).await;
    let discord = spawn_discord(&config, inbound_tx.clone()).await;
    let sidecar = spawn_sidecar(&config, inbound_tx.clone()).await;

    let (chat_event_tx, _) = broadcast::channel::<String>(256);
    let app_state = Arc::new(AppState {
        config: (*config).clone(),
        db: db.clone(),
        pipeline: pipeline.clone(),
        web_tx: inbound_tx.clone(),
        chat_event_tx: chat_event_tx.clone(),
        log_tx: log_tx.clone(),
        log_ring: log_ring.clone(),
        start_time: Instant::now(),
    });

    let web_handle = {
        let app_state = app_state.clone();
        let addr = format!("{}:{}", config.web_bind, config.web_port);
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&addr).await {
                Ok(l) => l,
                Err(e) => {
                    warn!("failed to bind web dashboard on {addr}: {e}");
                    return;
                }
            };
            info!("web dashboard listening on {addr}");
            if let Err(e) = axum::serve(listener, routes::router(app_state)).await {
                warn!("web server stopped: {e}");
            }
        })
    };

    spawn_signal_handler(shutdown.clone());

    info!(assistant = %config.assistant_name, model = %config.model, "borg started");

    let mut ticker = tokio::time::interval(Duration::from_millis(POLL_INTERVAL_MS));
    let mut tick_count: u64 = 0;

    loop {
        ticker.tick().await;
        tick_count += 1;

        if shutdown.load(Ordering::Acquire) {
            info!("shutdown signal received");
            break;
        }

        while let Ok(msg) = inbound_rx.try_recv() {
            match handle_incoming(&db, &config, &orchestrator, &msg, pipeline.clone()).await {
                Ok(Some(delivery)) => {
                    deliver_outcome(&db, telegram.as_ref(), discord.as_ref(), sidecar.as_ref(), &chat_event_tx, delivery).await;
                }
                Ok(None) => {}
                Err(e) => warn!("failed to handle incoming message from {}: {e}", msg.chat_id),
            }
        }

        if tick_count % SESSION_EXPIRY_TICKS == 0 {
            match db.expire_sessions(config.session_max_age_hours) {
                Ok(n) if n > 0 => debug!("expired {n} stale agent sessions"),
                Ok(_) => {}
                Err(e) => warn!("session expiry sweep failed: {e}"),
            }
        }

        for spawn in orchestrator.drain_expired_collections().await {
            dispatch_chat_agent(
                db.clone(),
                config.clone(),
                backend.clone(),
                orchestrator.clone(),
                spawn,
            );
        }

        for delivery in orchestrator.drain_completed(config.cooldown_ms).await {
            deliver_outcome(&db, telegram.as_ref(), discord.as_ref(), sidecar.as_ref(), &chat_event_tx, delivery).await;
        }

        orchestrator.expire_cooldowns().await;

        if force_restart.load(Ordering::Acquire) {
            info!("self-update sentinel set, preparing to re-exec");
            break;
        }
    }

    orchestrator.join_all().await;
    pipeline_handle.abort();
    web_handle.abort();

    if force_restart.load(Ordering::Acquire) {
        let _ = db.delete_kv("self_update_pending");
        drop(db);
        reexec_self()?;
    }

    Ok(())
}

fn spawn_signal_handler(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => info!("received SIGTERM"),
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        }
        shutdown.store(true, Ordering::Release);
    });
}

/// Re-executes the current binary in place, handling the case where the
/// running binary was replaced on disk by a just-merged self-update (the
/// kernel appends " (deleted)" to `/proc/self/exe`'s readlink target once
/// the original inode is unlinked).
fn reexec_self() -> Result<()> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("resolving current executable")?;
    let exe_str = exe.to_string_lossy();
    let exe_str = exe_str.strip_suffix(" (deleted)").unwrap_or(&exe_str);

    info!(exe = %exe_str, "re-executing for self-update");
    let err = std::process::Command::new(exe_str).args(std::env::args().skip(1)).exec();
    Err(anyhow::anyhow!("re-exec of {exe_str} failed: {err}"))
}

// ── Transport bootstrap ──────────────────────────────────────────────────

async fn spawn_telegram(config: &Config, inbound_tx: mpsc::UnboundedSender<IncomingMessage>) -> Option<Arc<Telegram>> {
    if config.telegram_token.is_empty() {
        return None;
    }
    let mut tg = Telegram::new(config.telegram_token.clone());
    if let Err(e) = tg.connect().await {
        warn!("Telegram connect failed, disabling transport: {e}");
        return None;
    }
    let tg = Arc::new(tg);
    let trigger = config.trigger_pattern.clone();
    {
        let tg = tg.clone();
        tokio::spawn(async move {
            loop {
                match tg.get_updates().await {
                    Ok(updates) => {
                        for u in updates {
                            let _ = inbound_tx.send(normalize_telegram(u, &trigger));
                        }
                    }
                    Err(e) => {
                        warn!("Telegram getUpdates failed: {e}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
    }
    Some(tg)
}

fn normalize_telegram(m: TgMessage, trigger: &str) -> IncomingMessage {
    let mentions_bot = m.mentions_bot || m.text.contains(trigger);
    IncomingMessage {
        chat_id: format!("tg:{}", m.chat_id),
        original_ref: m.chat_id.to_string(),
        message_id: m.message_id.to_string(),
        sender: m.sender_id.to_string(),
        sender_name: m.sender_name,
        text: m.text,
        timestamp: chrono::DateTime::from_timestamp(m.date, 0).unwrap_or_else(Utc::now),
        mentions_bot,
        transport: Transport::Telegram,
        chat_title: m.chat_title,
        chat_type: m.chat_type,
    }
}

async fn spawn_discord(config: &Config, inbound_tx: mpsc::UnboundedSender<IncomingMessage>) -> Option<Arc<Discord>> {
    if config.discord_token.is_empty() {
        return None;
    }
    let (discord, mut rx) = match Discord::spawn(&config.discord_token).await {
        Ok(v) => v,
        Err(e) => {
            warn!("Discord connect failed, disabling transport: {e}");
            return None;
        }
    };
    tokio::spawn(async move {
        while let Some(m) = rx.recv().await {
            let _ = inbound_tx.send(normalize_discord(m));
        }
    });
    Some(Arc::new(discord))
}

fn normalize_discord(m: DiscordMessage) -> IncomingMessage {
    IncomingMessage {
        chat_id: format!("discord:{}", m.channel_id),
        original_ref: m.channel_id.clone(),
        message_id: m.message_id,
        sender: m.sender_id,
        sender_name: m.sender_name,
        text: m.text,
        timestamp: chrono::DateTime::from_timestamp(m.timestamp, 0).unwrap_or_else(Utc::now),
        mentions_bot: m.mentions_bot,
        transport: Transport::Discord,
        chat_title: m.guild_id.unwrap_or_else(|| m.channel_id.clone()),
        chat_type: if m.is_dm { "private".to_string() } else { "group".to_string() },
    }
}

async fn spawn_sidecar(config: &Config, inbound_tx: mpsc::UnboundedSender<IncomingMessage>) -> Option<Arc<Sidecar>> {
    if config.wa_disabled {
        return None;
    }
    let (sidecar, mut rx) = match Sidecar::spawn(&config.assistant_name, &config.wa_auth_dir, config.wa_disabled).await {
        Ok(v) => v,
        Err(e) => {
            warn!("WhatsApp sidecar failed to start, disabling transport: {e}");
            return None;
        }
    };
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                SidecarEvent::Message(m) => {
                    let incoming = IncomingMessage {
                        chat_id: format!("wa:{}", m.chat_id),
                        original_ref: m.chat_id.clone(),
                        message_id: m.id,
                        sender: m.sender,
                        sender_name: m.sender_name,
                        text: m.text,
                        timestamp: chrono::DateTime::from_timestamp(m.timestamp, 0).unwrap_or_else(Utc::now),
                        mentions_bot: m.mentions_bot,
                        transport: Transport::WhatsApp,
                        chat_title: m.chat_id,
                        chat_type: if m.is_group { "group".to_string() } else { "private".to_string() },
                    };
                    let _ = inbound_tx.send(incoming);
                }
                SidecarEvent::WaConnected { .. } | SidecarEvent::WaQr { .. } => {}
                SidecarEvent::Disconnected { reason, .. } => warn!("WhatsApp sidecar disconnected: {reason}"),
                SidecarEvent::Error { message, .. } => warn!("WhatsApp sidecar error: {message}"),
            }
        }
    });
    Some(Arc::new(sidecar))
}

// ── Inbound handling ─────────────────────────────────────────────────────

/// Folder names are used as filesystem paths (`sessions/<folder>`), so a
/// chat id like `tg:-1001234` is mapped to something path-safe.
fn sanitize_folder(chat_id: &str) -> String {
    chat_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Ensures the message's chat has a row in `chats` before anything is
/// persisted against it (the `messages` table has a foreign key on
/// `chats.chat_id`). Private chats auto-register on first contact, the same
/// way a DM with a Telegram bot works without ceremony. Group chats require
/// an explicit `/register` so the bot doesn't start replying anywhere it's
/// merely been invited. Returns `true` if the message should proceed to
/// persistence/dispatch, `false` if it should be silently dropped.
async fn ensure_registered(db: &Db, config: &Config, msg: &IncomingMessage, is_register_cmd: bool) -> Result<bool> {
    if db.get_chat(&msg.chat_id)?.is_some() {
        return Ok(true);
    }
    if is_register_cmd {
        // The command handler performs the registration itself.
        return Ok(true);
    }
    if msg.chat_type == "private" {
        let chat = Chat {
            chat_id: msg.chat_id.clone(),
            display_name: if msg.sender_name.is_empty() { msg.chat_id.clone() } else { msg.sender_name.clone() },
            folder: sanitize_folder(&msg.chat_id),
            trigger_phrase: config.trigger_pattern.clone(),
            requires_trigger: false,
        };
        match db.register_chat(&chat) {
            Ok(()) => return Ok(true),
            Err(borg_core::types::StoreError::ConstraintViolation(_)) => return Ok(true),
            Err(e) => return Err(e.into()),
        }
    }
    debug!("dropping message from unregistered chat {}", msg.chat_id);
    Ok(false)
}

async fn handle_incoming(
    db: &Arc<Db>,
    config: &Arc<Config>,
    orchestrator: &Arc<ChatOrchestrator>,
    msg: &IncomingMessage,
    pipeline: Arc<Pipeline>,
) -> Result<Option<borg_core::chat::DeliveryInfo>> {
    let first_line = msg.text.lines().next().unwrap_or("").trim();
    let is_command = first_line.starts_with('/');
    let command_name = first_line.split_whitespace().next().unwrap_or("");

    if !ensure_registered(db, config, msg, command_name.eq_ignore_ascii_case("/register")).await? {
        return Ok(None);
    }

    if is_command {
        let reply = handle_command(db, config, &pipeline, msg).await;
        store_inbound(db, msg)?;
        return Ok(reply.map(|reply| borg_core::chat::DeliveryInfo {
            chat_id: msg.chat_id.clone(),
            trigger_msg_id: msg.message_id.clone(),
            original_ref: msg.original_ref.clone(),
            transport: msg.transport,
            outcome: Outcome { success: true, reply },
        }));
    }

    store_inbound(db, msg)?;

    let chat = db.get_chat(&msg.chat_id)?;
    let should_trigger = match &chat {
        Some(c) => !c.requires_trigger || msg.mentions_bot,
        None => false,
    };

    if should_trigger {
        let admission = AdmissionConfig {
            collection_window_ms: config.collection_window_ms,
            rate_limit_per_minute: config.rate_limit_per_minute,
            max_concurrent_agents: config.max_concurrent_agents,
        };
        orchestrator
            .on_trigger(&msg.chat_id, &msg.message_id, &msg.original_ref, msg.transport, admission)
            .await;
    } else {
        orchestrator.extend_collection(&msg.chat_id, config.collection_window_ms).await;
    }

    Ok(None)
}

fn store_inbound(db: &Db, msg: &IncomingMessage) -> Result<()> {
    let m = Message {
        chat_id: msg.chat_id.clone(),
        message_id: msg.message_id.clone(),
        sender_id: msg.sender.clone(),
        sender_display: msg.sender_name.clone(),
        body: msg.text.clone(),
        timestamp: msg.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
        is_from_self: false,
        is_bot_reply: false,
    };
    db.store_message(&m)?;
    Ok(())
}

fn persist_bot_reply(db: &Db, chat_id: &str, text: &str) -> Result<()> {
    let now = Utc::now();
    let m = Message {
        chat_id: chat_id.to_string(),
        message_id: format!("bot-{}", now.timestamp_millis()),
        sender_id: "bot".to_string(),
        sender_display: "bot".to_string(),
        body: text.to_string(),
        timestamp: now.format("%Y-%m-%d %H:%M:%S").to_string(),
        is_from_self: true,
        is_bot_reply: true,
    };
    db.store_message(&m)?;
    Ok(())
}

// ── Commands ─────────────────────────────────────────────────────────────

async fn handle_command(db: &Db, config: &Config, pipeline: &Arc<Pipeline>, msg: &IncomingMessage) -> Option<String> {
    let first_line = msg.text.lines().next().unwrap_or("").trim();
    let mut parts = first_line.splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or("").to_ascii_lowercase();
    let rest = parts.next().unwrap_or("").trim();

    match cmd.as_str() {
        "/register" => {
            if db.get_chat(&msg.chat_id).ok()?.is_some() {
                return Some("This chat is already registered.".to_string());
            }
            let chat = Chat {
                chat_id: msg.chat_id.clone(),
                display_name: if msg.chat_title.is_empty() { msg.chat_id.clone() } else { msg.chat_title.clone() },
                folder: sanitize_folder(&msg.chat_id),
                trigger_phrase: config.trigger_pattern.clone(),
                requires_trigger: msg.chat_type != "private",
            };
            match db.register_chat(&chat) {
                Ok(()) => Some(format!("Registered. I'll answer here {}.", if chat.requires_trigger {
                    format!("when mentioned with {}", config.trigger_pattern)
                } else {
                    "to every message".to_string()
                })),
                Err(e) => Some(format!("Could not register this chat: {e}")),
            }
        }
        "/unregister" => match db.unregister_chat(&msg.chat_id) {
            Ok(()) => Some("Unregistered. I won't respond here anymore.".to_string()),
            Err(e) => Some(format!("Failed to unregister: {e}")),
        },
        "/chatid" => Some(format!("chat_id: {}", msg.chat_id)),
        "/ping" => Some("pong".to_string()),
        "/version" => Some(format!("borg {}", env!("CARGO_PKG_VERSION"))),
        "/start" | "/help" => Some(
            "Commands:\n\
             /register - start responding in this chat\n\
             /unregister - stop responding in this chat\n\
             /status - runtime status\n\
             /groups - list registered chats\n\
             /chatid - show this chat's id\n\
             /ping - liveness check\n\
             /version - build version\n\
             /task <title>\\n<description> - enqueue a pipeline task\n\
             /tasks - list active pipeline tasks\n\
             /pipeline - pipeline summary"
                .to_string(),
        ),
        "/status" => {
            let active = db.list_active_tasks().ok()?.len();
            Some(format!(
                "{} up, model {}, {} active agents, {} active pipeline tasks",
                config.assistant_name,
                config.model,
                pipeline.active_agent_count(),
                active
            ))
        }
        "/groups" => {
            let chats = db.list_chats().ok()?;
            if chats.is_empty() {
                return Some("No chats registered.".to_string());
            }
            let lines: Vec<String> = chats.iter().map(|c| format!("- {} ({})", c.display_name, c.chat_id)).collect();
            Some(lines.join("\n"))
        }
        "/task" => {
            if config.pipeline_repo.is_empty() {
                return Some("No default repo configured for the pipeline.".to_string());
            }
            let mut lines = msg.text.lines();
            lines.next(); // drop the "/task <title>" line, re-split below
            let title = rest.to_string();
            if title.is_empty() {
                return Some("Usage: /task <title>\\n<description>".to_string());
            }
            let description = lines.collect::<Vec<_>>().join("\n");
            match db.create_task(&title, &description, &config.pipeline_repo, &msg.sender_name, &msg.chat_id, 5) {
                Ok(id) => Some(format!("Queued task #{id}: {title}")),
                Err(e) => Some(format!("Failed to create task: {e}")),
            }
        }
        "/tasks" => {
            let tasks = db.list_active_tasks().ok()?;
            if tasks.is_empty() {
                return Some("No active tasks.".to_string());
            }
            let lines: Vec<String> = tasks.iter().take(20).map(|t: &Task| format!("#{} [{}] {}", t.id, t.status, t.title)).collect();
            Some(lines.join("\n"))
        }
        "/pipeline" => {
            let queued = db.list_queued().ok()?.len();
            Some(format!(
                "{} agents running, {} branches queued for integration, release every {}m",
                pipeline.active_agent_count(),
                queued,
                config.release_interval_mins
            ))
        }
        _ => Some(format!("Unknown command: {cmd}. Try /help.")),
    }
}

// ── Chat agent dispatch ──────────────────────────────────────────────────

fn dispatch_chat_agent(
    db: Arc<Db>,
    config: Arc<Config>,
    backend: Arc<dyn AgentBackend>,
    orchestrator: Arc<ChatOrchestrator>,
    spawn: borg_core::chat::SpawnInfo,
) {
    tokio::spawn(async move {
        if !orchestrator.start_running(&spawn.chat_id).await {
            return;
        }

        let outcome = run_chat_agent(&db, &config, backend.as_ref(), &spawn.chat_id).await;
        orchestrator.set_outcome(&spawn.chat_id, outcome).await;
    });
}

async fn run_chat_agent(db: &Db, config: &Config, backend: &dyn AgentBackend, chat_id: &str) -> Outcome {
    let chat = match db.get_chat(chat_id) {
        Ok(Some(c)) => c,
        Ok(None) => return Outcome { success: false, reply: "This chat is no longer registered.".to_string() },
        Err(e) => return Outcome { success: false, reply: format!("Store error: {e}") },
    };

    let messages = match db.messages_since(chat_id, "1970-01-01 00:00:00") {
        Ok(m) => m,
        Err(e) => return Outcome { success: false, reply: format!("Store error: {e}") },
    };

    let instruction = build_chat_instruction(&config.assistant_name, &messages);

    let session_dir = format!("{}/sessions/{}", config.data_dir, chat.folder);
    if let Err(e) = tokio::fs::create_dir_all(&session_dir).await {
        return Outcome { success: false, reply: format!("Failed to prepare session directory: {e}") };
    }

    let existing_session = db.get_session(&chat.folder).ok().flatten().map(|s| s.session_id);

    let result = backend
        .run(
            &session_dir,
            &session_dir,
            instruction.as_bytes(),
            existing_session.as_deref(),
            config.agent_timeout_s.max(0) as u64,
            None,
        )
        .await;

    match result {
        Ok(r) => {
            if let Some(sid) = &r.new_session_id {
                let _ = db.set_session(&chat.folder, sid);
            }
            Outcome { success: r.success, reply: r.output }
        }
        Err(e) => Outcome { success: false, reply: format!("Agent run failed: {e}") },
    }
}

// ── Delivery ─────────────────────────────────────────────────────────────

async fn deliver_outcome(
    db: &Db,
    telegram: Option<&Arc<Telegram>>,
    discord: Option<&Arc<Discord>>,
    sidecar: Option<&Arc<Sidecar>>,
    chat_event_tx: &broadcast::Sender<String>,
    delivery: borg_core::chat::DeliveryInfo,
) {
    if let Err(e) = persist_bot_reply(db, &delivery.chat_id, &delivery.outcome.reply) {
        warn!("failed to persist bot reply for {}: {e}", delivery.chat_id);
    }

    match delivery.transport {
        Transport::Telegram => {
            if let Some(tg) = telegram {
                let chat_id: i64 = match delivery.original_ref.parse() {
                    Ok(v) => v,
                    Err(_) => return,
                };
                let reply_to: Option<i64> = delivery.trigger_msg_id.parse().ok();
                if let Err(e) = tg.send_message(chat_id, &delivery.outcome.reply, reply_to).await {
                    warn!("Telegram send failed: {e}");
                }
            }
        }
        Transport::Discord => {
            if let Some(d) = discord {
                if let Err(e) = d.send_message(&delivery.original_ref, &delivery.outcome.reply).await {
                    warn!("Discord send failed: {e}");
                }
            }
        }
        Transport::WhatsApp => {
            if let Some(s) = sidecar {
                s.send_whatsapp(&delivery.original_ref, &delivery.outcome.reply, Some(&delivery.trigger_msg_id));
            }
        }
        Transport::Web => {
            let event = serde_json::json!({
                "role": "assistant",
                "text": delivery.outcome.reply,
                "ts": Utc::now().timestamp(),
            })
            .to_string();
            let _ = chat_event_tx.send(event);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
