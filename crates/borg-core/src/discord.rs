use std::sync::Arc;

use anyhow::{Context, Result};
use serenity::all::{ChannelId, GatewayIntents, Http, Message as SerenityMessage, Ready};
use serenity::async_trait;
use serenity::client::{Client, Context as SerenityContext, EventHandler};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// An incoming Discord message, normalized the same way `TgMessage` and
/// `SidecarMessage` are.
#[derive(Debug, Clone)]
pub struct DiscordMessage {
    pub message_id: String,
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp: i64,
    pub is_dm: bool,
    pub mentions_bot: bool,
    pub reply_to_text: Option<String>,
}

struct Handler {
    bot_user_id: std::sync::Mutex<Option<u64>>,
    tx: mpsc::UnboundedSender<DiscordMessage>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: SerenityContext, ready: Ready) {
        *self.bot_user_id.lock().unwrap() = Some(ready.user.id.get());
        info!("Discord bot connected as {}", ready.user.name);
    }

    async fn message(&self, _ctx: SerenityContext, msg: SerenityMessage) {
        let bot_id = *self.bot_user_id.lock().unwrap();
        if bot_id == Some(msg.author.id.get()) {
            return; // never react to our own messages
        }
        if msg.content.is_empty() {
            return;
        }

        let mentions_bot = bot_id
            .map(|id| msg.mentions.iter().any(|u| u.id.get() == id))
            .unwrap_or(false);

        let reply_to_text = msg.referenced_message.as_ref().map(|m| m.content.clone());

        let normalized = DiscordMessage {
            message_id: msg.id.get().to_string(),
            channel_id: msg.channel_id.get().to_string(),
            guild_id: msg.guild_id.map(|g| g.get().to_string()),
            sender_id: msg.author.id.get().to_string(),
            sender_name: msg.author.name.clone(),
            text: msg.content.clone(),
            timestamp: msg.timestamp.unix_timestamp(),
            is_dm: msg.guild_id.is_none(),
            mentions_bot,
            reply_to_text,
        };

        if self.tx.send(normalized).is_err() {
            warn!("Discord message dropped: receiver gone");
        }
    }
}

/// Thin serenity-backed client: connects the gateway, normalizes `message`
/// events onto an mpsc channel, and exposes a `Http`-backed sender so replies
/// don't need to go back through the gateway connection.
pub struct Discord {
    http: Arc<Http>,
}

impl Discord {
    /// Start the gateway client as a background task and return (Discord,
    /// message_rx). The caller polls `message_rx` the same way it polls
    /// `Telegram::get_updates` or the sidecar's event channel.
    pub async fn spawn(token: &str) -> Result<(Self, mpsc::UnboundedReceiver<DiscordMessage>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Handler {
            bot_user_id: std::sync::Mutex::new(None),
            tx,
        };

        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;

        let mut client = Client::builder(token, intents)
            .event_handler(handler)
            .await
            .context("failed to build Discord client")?;

        let http = client.http.clone();

        tokio::spawn(async move {
            if let Err(e) = client.start().await {
                warn!("Discord client stopped: {e}");
            }
        });

        Ok((Self { http }, rx))
    }

    /// Send a text message to a channel, chunked under Discord's 2000-char
    /// message limit.
    pub async fn send_message(&self, channel_id: &str, text: &str) -> Result<()> {
        let id: u64 = channel_id.parse().context("invalid Discord channel id")?;
        let channel = ChannelId::new(id);
        for chunk in split_text(text, 1900) {
            channel
                .say(&self.http, chunk)
                .await
                .context("Discord sendMessage failed")?;
        }
        Ok(())
    }
}

fn split_text(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while remaining.len() > limit {
        let cut = remaining[..limit].rfind('\n').unwrap_or(limit);
        chunks.push(remaining[..cut].to_string());
        remaining = remaining[cut..].trim_start_matches('\n');
    }
    if !remaining.is_empty() {
        chunks.push(remaining.to_string());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_text_respects_limit_and_newline_boundary() {
        let text = format!("{}\n{}", "a".repeat(1800), "b".repeat(1800));
        let chunks = split_text(&text, 1900);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].len() <= 1900);
        assert!(chunks[1].starts_with('b'));
    }

    #[test]
    fn split_text_single_chunk_when_under_limit() {
        let chunks = split_text("short message", 1900);
        assert_eq!(chunks, vec!["short message".to_string()]);
    }
}
