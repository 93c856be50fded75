use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    WhatsApp,
}

#[derive(Debug, Clone)]
pub struct SidecarMessage {
    pub source: Source,
    pub id: String,
    pub chat_id: String,
    pub sender: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp: i64,
    pub is_group: bool,
    pub mentions_bot: bool,
}

#[derive(Debug, Clone)]
pub enum SidecarEvent {
    Message(SidecarMessage),
    WaConnected { jid: String },
    WaQr { data: String },
    Disconnected { source: Source, reason: String },
    Error { source: Source, message: String },
}

/// Client for the third-party WhatsApp bridge.js sidecar process.
pub struct Sidecar {
    cmd_tx: mpsc::UnboundedSender<String>,
}

impl Sidecar {
    /// Spawn `bun sidecar/bridge.js` and return (Sidecar, event_rx).
    pub async fn spawn(
        assistant_name: &str,
        wa_auth_dir: &str,
        wa_disabled: bool,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SidecarEvent>)> {
        let mut cmd = Command::new("bun");
        cmd.args(["sidecar/bridge.js", assistant_name]);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::inherit());
        if !wa_auth_dir.is_empty() {
            cmd.env("WA_AUTH_DIR", wa_auth_dir);
        }
        if wa_disabled {
            cmd.env("WA_DISABLED", "true");
        }

        let mut child = cmd.spawn().context("failed to spawn sidecar/bridge.js")?;
        let stdin = child.stdin.take().context("sidecar stdin unavailable")?;
        let stdout = child.stdout.take().context("sidecar stdout unavailable")?;

        let (event_tx, event_rx) = mpsc::unbounded_channel::<SidecarEvent>();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<String>();

        // Stdout reader → events
        let event_tx2 = event_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    continue;
                }
                let Some(event) = parse_event(&line) else {
                    continue;
                };
                match &event {
                    SidecarEvent::WaConnected { jid } => {
                        info!("WhatsApp connected as {}", jid);
                    }
                    SidecarEvent::WaQr { .. } => {
                        info!("WhatsApp QR code generated - scan with phone");
                    }
                    SidecarEvent::Disconnected { source, reason } => {
                        warn!("Sidecar {:?} disconnected: {}", source, reason);
                    }
                    SidecarEvent::Error { source, message } => {
                        warn!("Sidecar {:?} error: {}", source, message);
                    }
                    _ => {}
                }
                let _ = event_tx2.send(event);
            }
        });

        // Stdin writer ← commands
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = cmd_rx.recv().await {
                let payload = format!("{line}\n");
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    warn!("Sidecar stdin write error: {}", e);
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        // Keep child alive; warn on exit
        tokio::spawn(async move {
            let _ = child.wait().await;
            warn!("Sidecar process exited");
        });

        info!("Sidecar process started");
        Ok((Self { cmd_tx }, event_rx))
    }

    pub fn send_whatsapp(&self, jid: &str, text: &str, quote_id: Option<&str>) {
        let escaped = json_escape(text);
        let mut cmd = format!(
            r#"{{"target":"whatsapp","cmd":"send","jid":"{jid}","text":"{escaped}""#
        );
        if let Some(id) = quote_id {
            cmd.push_str(&format!(r#","quote_id":"{id}""#));
        }
        cmd.push('}');
        self.cmd_tx.send(cmd).ok();
    }

    pub fn send_whatsapp_typing(&self, jid: &str) {
        let cmd = format!(r#"{{"target":"whatsapp","cmd":"typing","jid":"{jid}"}}"#);
        self.cmd_tx.send(cmd).ok();
    }
}

fn parse_source(s: &str) -> Option<Source> {
    match s {
        "whatsapp" => Some(Source::WhatsApp),
        _ => None,
    }
}

fn parse_event(line: &str) -> Option<SidecarEvent> {
    let v: Value = serde_json::from_str(line).ok()?;
    let source_str = v["source"].as_str()?;
    let event_type = v["event"].as_str()?;
    let source = parse_source(source_str)?;

    let ev = match event_type {
        "message" => {
            let msg = SidecarMessage {
                source: Source::WhatsApp,
                id: str_val(&v, "id"),
                chat_id: str_val(&v, "jid"),
                sender: str_val(&v, "sender"),
                sender_name: str_val(&v, "sender_name"),
                text: str_val(&v, "text"),
                timestamp: v["timestamp"].as_i64().unwrap_or(0),
                is_group: v["is_group"].as_bool().unwrap_or(false),
                mentions_bot: v["mentions_bot"].as_bool().unwrap_or(false),
            };
            SidecarEvent::Message(msg)
        }
        "connected" => SidecarEvent::WaConnected { jid: str_val(&v, "jid") },
        "qr" => SidecarEvent::WaQr { data: str_val(&v, "data") },
        "disconnected" => SidecarEvent::Disconnected {
            source,
            reason: str_val(&v, "reason"),
        },
        "error" => SidecarEvent::Error {
            source,
            message: str_val(&v, "message"),
        },
        _ => return None,
    };
    Some(ev)
}

fn str_val(v: &Value, key: &str) -> String {
    v[key].as_str().unwrap_or("").to_string()
}

/// Escape a string for embedding inside a JSON string literal.
fn json_escape(s: &str) -> String {
    // serde_json::to_string produces `"..."` including quotes; strip them
    let quoted = serde_json::to_string(s).unwrap_or_default();
    if quoted.len() < 2 {
        return String::new();
    }
    quoted[1..quoted.len() - 1].to_string()
}

// ── Tests ──────────────────────────────────────────────────────────────────
