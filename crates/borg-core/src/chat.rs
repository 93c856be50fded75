use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use crate::types::Transport;

/// The 4-phase lifecycle of a single chat. A chat debounces user triggers
/// through `Collecting`, runs exactly one agent at a time in `Running`, and
/// sits in `Cooldown` for a short window after the agent finishes so a flurry
/// of late messages doesn't immediately re-trigger it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Collecting,
    Running,
    Cooldown,
}

/// The result of a completed agent run, handed back to the chat by the
/// completion callback and delivered to the transport on the next drain.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub success: bool,
    pub reply: String,
}

/// Rate/concurrency knobs consulted by `on_trigger`.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionConfig {
    pub collection_window_ms: u64,
    pub rate_limit_per_minute: u32,
    pub max_concurrent_agents: u32,
}

struct ChatState {
    phase: Phase,
    collect_deadline: Option<Instant>,
    cooldown_deadline: Option<Instant>,
    trigger_msg_id: String,
    original_ref: String,
    transport: Option<Transport>,
    outcome: Option<Outcome>,
    rate_window_start: Instant,
    trigger_count: u32,
}

impl ChatState {
    fn idle() -> Self {
        Self {
            phase: Phase::Idle,
            collect_deadline: None,
            cooldown_deadline: None,
            trigger_msg_id: String::new(),
            original_ref: String::new(),
            transport: None,
            outcome: None,
            rate_window_start: Instant::now(),
            trigger_count: 0,
        }
    }
}

/// One entry per chat whose collection window has expired, ready to be
/// dispatched to an agent.
pub struct SpawnInfo {
    pub chat_id: String,
    pub trigger_msg_id: String,
    pub original_ref: String,
    pub transport: Transport,
}

/// One entry per chat whose agent finished and entered cooldown, ready for
/// the reply to be delivered back to its transport.
pub struct DeliveryInfo {
    pub chat_id: String,
    pub trigger_msg_id: String,
    pub original_ref: String,
    pub transport: Transport,
    pub outcome: Outcome,
}

/// Per-chat 4-phase state machine gating debounced trigger collection and
/// concurrent agent dispatch.
pub struct ChatOrchestrator {
    chats: Mutex<HashMap<String, ChatState>>,
    active_agents: std::sync::atomic::AtomicU32,
}

impl ChatOrchestrator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            chats: Mutex::new(HashMap::new()),
            active_agents: std::sync::atomic::AtomicU32::new(0),
        })
    }

    pub fn active_agent_count(&self) -> u32 {
        self.active_agents.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Admits a trigger only from `Idle`, under a rolling 60s per-chat rate
    /// cap and a global concurrency cap, both checked while holding the lock.
    pub async fn on_trigger(
        &self,
        chat_id: &str,
        msg_id: &str,
        original_ref: &str,
        transport: Transport,
        cfg: AdmissionConfig,
    ) -> bool {
        let mut chats = self.chats.lock().await;
        let state = chats.entry(chat_id.to_string()).or_insert_with(ChatState::idle);

        if state.phase != Phase::Idle {
            return false;
        }

        let now = Instant::now();
        if now.duration_since(state.rate_window_start) >= Duration::from_secs(60) {
            state.rate_window_start = now;
            state.trigger_count = 0;
        }
        if state.trigger_count >= cfg.rate_limit_per_minute {
            debug!(chat_id, "rate limit exceeded, rejecting trigger");
            return false;
        }
        if self.active_agent_count() >= cfg.max_concurrent_agents {
            debug!(chat_id, "global agent concurrency cap reached, rejecting trigger");
            return false;
        }

        state.trigger_count += 1;
        state.phase = Phase::Collecting;
        state.collect_deadline = Some(now + Duration::from_millis(cfg.collection_window_ms));
        state.trigger_msg_id = msg_id.to_string();
        state.original_ref = original_ref.to_string();
        state.transport = Some(transport);
        true
    }

    /// Slides the collection deadline forward, capped at `+2000ms` past the
    /// original deadline so one chat can't starve the dispatcher forever.
    pub async fn extend_collection(&self, chat_id: &str, extension_ms: u64) {
        let mut chats = self.chats.lock().await;
        if let Some(state) = chats.get_mut(chat_id) {
            if state.phase != Phase::Collecting {
                return;
            }
            if let Some(deadline) = state.collect_deadline {
                let now = Instant::now();
                let extended = std::cmp::max(deadline, now + Duration::from_millis(extension_ms));
                let cap = deadline + Duration::from_millis(2_000);
                state.collect_deadline = Some(std::cmp::min(extended, cap));
            }
        }
    }

    pub async fn drain_expired_collections(&self) -> Vec<SpawnInfo> {
        let chats = self.chats.lock().await;
        let now = Instant::now();
        chats
            .iter()
            .filter_map(|(chat_id, state)| {
                if state.phase == Phase::Collecting && state.collect_deadline.map(|d| now >= d).unwrap_or(false) {
                    Some(SpawnInfo {
                        chat_id: chat_id.clone(),
                        trigger_msg_id: state.trigger_msg_id.clone(),
                        original_ref: state.original_ref.clone(),
                        transport: state.transport.unwrap_or(Transport::Web),
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    /// `Collecting -> Running`. Returns false if the phase changed underfoot
    /// (the caller should let the agent run but discard its outcome).
    pub async fn start_running(&self, chat_id: &str) -> bool {
        let mut chats = self.chats.lock().await;
        match chats.get_mut(chat_id) {
            Some(state) if state.phase == Phase::Collecting => {
                state.phase = Phase::Running;
                self.active_agents.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Called by the agent completion callback. Dropped silently if the chat
    /// was removed in the meantime.
    pub async fn set_outcome(&self, chat_id: &str, outcome: Outcome) {
        let mut chats = self.chats.lock().await;
        if let Some(state) = chats.get_mut(chat_id) {
            state.outcome = Some(outcome);
        }
    }

    /// `Running -> Cooldown` for every chat with a pending outcome.
    /// Trigger/original-ref fields stay alive through cooldown so the reply
    /// can still thread correctly.
    pub async fn drain_completed(&self, cooldown_ms: u64) -> Vec<DeliveryInfo> {
        let mut chats = self.chats.lock().await;
        let now = Instant::now();
        let mut deliveries = Vec::new();
        for (chat_id, state) in chats.iter_mut() {
            if state.phase == Phase::Running {
                if let Some(outcome) = state.outcome.take() {
                    state.phase = Phase::Cooldown;
                    state.cooldown_deadline = Some(now + Duration::from_millis(cooldown_ms));
                    self.active_agents.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                    deliveries.push(DeliveryInfo {
                        chat_id: chat_id.clone(),
                        trigger_msg_id: state.trigger_msg_id.clone(),
                        original_ref: state.original_ref.clone(),
                        transport: state.transport.unwrap_or(Transport::Web),
                        outcome,
                    });
                }
            }
        }
        deliveries
    }

    pub async fn expire_cooldowns(&self) {
        let mut chats = self.chats.lock().await;
        let now = Instant::now();
        for state in chats.values_mut() {
            if state.phase == Phase::Cooldown && state.cooldown_deadline.map(|d| now >= d).unwrap_or(false) {
                state.phase = Phase::Idle;
                state.trigger_msg_id.clear();
                state.original_ref.clear();
                state.cooldown_deadline = None;
            }
        }
    }

    /// Shutdown path: waits for every in-flight agent to clear `Running`.
    pub async fn join_all(&self) {
        loop {
            if self.active_agent_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[cfg(test)]
    async fn phase_of(&self, chat_id: &str) -> Option<Phase> {
        self.chats.lock().await.get(chat_id).map(|s| s.phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AdmissionConfig {
        AdmissionConfig {
            collection_window_ms: 10,
            rate_limit_per_minute: 2,
            max_concurrent_agents: 5,
        }
    }

    #[tokio::test]
    async fn on_trigger_admits_only_from_idle() {
        let orch = ChatOrchestrator::new();
        assert!(orch.on_trigger("tg:1", "m1", "1", Transport::Telegram, cfg()).await);
        assert!(!orch.on_trigger("tg:1", "m2", "1", Transport::Telegram, cfg()).await);
        assert_eq!(orch.phase_of("tg:1").await, Some(Phase::Collecting));
    }

    #[tokio::test]
    async fn rate_limit_rejects_beyond_cap() {
        let orch = ChatOrchestrator::new();
        let c = cfg();
        assert!(orch.on_trigger("tg:1", "m1", "1", Transport::Telegram, c).await);
        orch.drain_expired_collections().await;
        // Force back to idle without running an agent, simulating a fast
        // external completion, to exercise the rate window in isolation.
        {
            let mut chats = orch.chats.lock().await;
            chats.get_mut("tg:1").unwrap().phase = Phase::Idle;
        }
        assert!(orch.on_trigger("tg:1", "m2", "1", Transport::Telegram, c).await);
        {
            let mut chats = orch.chats.lock().await;
            chats.get_mut("tg:1").unwrap().phase = Phase::Idle;
        }
        assert!(!orch.on_trigger("tg:1", "m3", "1", Transport::Telegram, c).await);
    }

    #[tokio::test]
    async fn full_lifecycle_reaches_cooldown_then_idle() {
        let orch = ChatOrchestrator::new();
        let c = cfg();
        assert!(orch.on_trigger("tg:1", "m1", "1", Transport::Telegram, c).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let spawns = orch.drain_expired_collections().await;
        assert_eq!(spawns.len(), 1);
        assert!(orch.start_running("tg:1").await);
        assert_eq!(orch.active_agent_count(), 1);
        orch.set_outcome("tg:1", Outcome { success: true, reply: "hi".into() }).await;
        let deliveries = orch.drain_completed(10).await;
        assert_eq!(deliveries.len(), 1);
        assert_eq!(orch.active_agent_count(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        orch.expire_cooldowns().await;
        assert_eq!(orch.phase_of("tg:1").await, Some(Phase::Idle));
    }
}
