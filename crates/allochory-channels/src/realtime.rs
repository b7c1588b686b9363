//! Ably realtime link used to enter and leave presence
//!
//! Presence membership is tied to a realtime connection, so the REST adapter
//! opens one lazily on the first enter. The link attaches to the channel in
//! presence-only mode and enters each agent as its own member
//! (`<client_id>/<agent_id>`), which an API-key connection is allowed to do.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use allochory_core::types::PresenceRecord;
use anyhow::{Context, Result, anyhow, bail};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_REALTIME_URL: &str = "wss://realtime.ably.io";
const PROTOCOL_VERSION: &str = "1.2";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Protocol message actions
mod action {
    pub const HEARTBEAT: u8 = 0;
    pub const ACK: u8 = 1;
    pub const NACK: u8 = 2;
    pub const CONNECTED: u8 = 4;
    pub const DISCONNECTED: u8 = 6;
    pub const CLOSE: u8 = 7;
    pub const CLOSED: u8 = 8;
    pub const ERROR: u8 = 9;
    pub const ATTACH: u8 = 10;
    pub const ATTACHED: u8 = 11;
    pub const PRESENCE: u8 = 14;
}

const PRESENCE_ENTER: u8 = 2;
const PRESENCE_LEAVE: u8 = 3;
/// Channel mode flag: may enter presence, receives no messages
const MODE_PRESENCE: u64 = 1 << 16;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<()>>>>>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtocolMessage {
    action: u8,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    msg_serial: Option<u64>,
    #[serde(default)]
    count: Option<u64>,
    #[serde(default)]
    error: Option<ErrorInfo>,
}

#[derive(Debug, Deserialize)]
struct ErrorInfo {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = self.message.as_deref().unwrap_or("unknown error");
        match self.code {
            Some(code) => write!(f, "{} (code {})", message, code),
            None => write!(f, "{}", message),
        }
    }
}

fn describe(error: Option<&ErrorInfo>) -> String {
    error
        .map(ToString::to_string)
        .unwrap_or_else(|| "no error details".to_string())
}

fn text_frame(value: &Value) -> Message {
    Message::Text(value.to_string().into())
}

/// Presence member id for one agent hosted by `client_id`
pub fn member_id(client_id: &str, agent_id: &str) -> String {
    format!("{}/{}", client_id, agent_id)
}

fn presence_frame(
    channel: &str,
    serial: u64,
    member_action: u8,
    member: &str,
    record: Option<&PresenceRecord>,
) -> Result<Value> {
    let mut entry = json!({ "action": member_action, "clientId": member });
    if let Some(record) = record {
        entry["data"] = Value::String(serde_json::to_string(record)?);
        entry["encoding"] = json!("json");
    }
    Ok(json!({
        "action": action::PRESENCE,
        "channel": channel,
        "msgSerial": serial,
        "presence": [entry],
    }))
}

/// Read frames until `wanted` arrives; errors and disconnects abort the handshake
async fn read_until(ws: &mut WsStream, wanted: u8) -> Result<ProtocolMessage> {
    while let Some(frame) = ws.next().await {
        let text = match frame.context("Ably realtime connection failed")? {
            Message::Text(text) => text,
            Message::Close(_) => bail!("Ably closed the realtime connection"),
            _ => continue,
        };
        let message: ProtocolMessage = match serde_json::from_str(text.as_str()) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring unparseable realtime frame: {}", e);
                continue;
            }
        };
        if message.action == wanted {
            return Ok(message);
        }
        if matches!(
            message.action,
            action::ERROR | action::DISCONNECTED | action::CLOSED
        ) {
            bail!(
                "Ably refused the realtime connection: {}",
                describe(message.error.as_ref())
            );
        }
    }
    bail!("Ably realtime connection ended during handshake")
}

async fn expect_action(ws: &mut WsStream, wanted: u8) -> Result<ProtocolMessage> {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_until(ws, wanted)).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("Timed out waiting for Ably realtime handshake")),
    }
}

/// Resolve acknowledgements; returns false when the connection is finished
async fn handle_frame(text: &str, pending: &Pending) -> bool {
    let message: ProtocolMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!("Ignoring unparseable realtime frame: {}", e);
            return true;
        }
    };

    match message.action {
        action::ACK | action::NACK => {
            let first = message.msg_serial.unwrap_or_default();
            let count = message.count.unwrap_or(1);
            let mut pending = pending.lock().await;
            for serial in first..first + count {
                let Some(waiter) = pending.remove(&serial) else {
                    continue;
                };
                let result = if message.action == action::ACK {
                    Ok(())
                } else {
                    Err(anyhow!("Ably rejected presence update: {}", describe(message.error.as_ref())))
                };
                let _ = waiter.send(result);
            }
            true
        }
        action::ERROR => {
            error!(
                "Ably realtime error on {}: {}",
                message.channel.as_deref().unwrap_or("connection"),
                describe(message.error.as_ref())
            );
            false
        }
        action::DISCONNECTED | action::CLOSED => {
            info!("Ably realtime connection ended: {}", describe(message.error.as_ref()));
            false
        }
        action::HEARTBEAT => true,
        other => {
            debug!("Ignoring realtime action {}", other);
            true
        }
    }
}

/// Shuttle outbound frames and inbound acknowledgements until cancelled
async fn pump(
    mut sink: SplitSink<WsStream, Message>,
    mut stream: SplitStream<WsStream>,
    mut outbound: mpsc::Receiver<Message>,
    pending: Pending,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = sink.send(text_frame(&json!({ "action": action::CLOSE }))).await {
                    debug!("Failed to send realtime close: {}", e);
                }
                break;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame).await {
                    error!("Failed to write to Ably realtime connection: {}", e);
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_frame(text.as_str(), &pending).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("Ably realtime connection closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Ably realtime connection error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = sink.close().await {
        debug!("Failed to close realtime socket: {}", e);
    }
    // Waiters see the dropped sender as a lost connection
    pending.lock().await.clear();
}

struct Link {
    outbound: mpsc::Sender<Message>,
    pending: Pending,
    next_serial: u64,
    entered: Vec<String>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Link {
    fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Send one presence update and wait for Ably to acknowledge it
    async fn send_presence(
        &mut self,
        channel: &str,
        member_action: u8,
        member: &str,
        record: Option<&PresenceRecord>,
    ) -> Result<()> {
        let serial = self.next_serial;
        self.next_serial += 1;
        let frame = presence_frame(channel, serial, member_action, member, record)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(serial, tx);
        if self.outbound.send(text_frame(&frame)).await.is_err() {
            self.pending.lock().await.remove(&serial);
            bail!("Ably realtime connection is closed");
        }

        match tokio::time::timeout(ACK_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(anyhow!("Ably realtime connection dropped before acknowledging")),
            Err(_) => {
                self.pending.lock().await.remove(&serial);
                Err(anyhow!("Timed out waiting for Ably to acknowledge presence"))
            }
        }
    }
}

/// Lazily connected presence session for one channel
pub struct RealtimePresence {
    url: Url,
    channel: String,
    client_id: String,
    link: Mutex<Option<Link>>,
}

impl RealtimePresence {
    pub fn new(realtime_url: &str, api_key: &str, channel: &str, client_id: &str) -> Result<Self> {
        let mut url = Url::parse(realtime_url)
            .with_context(|| format!("Invalid Ably realtime URL: {}", realtime_url))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            bail!("Ably realtime URL must use ws:// or wss://: {}", realtime_url);
        }
        url.query_pairs_mut()
            .append_pair("key", api_key)
            .append_pair("format", "json")
            .append_pair("v", PROTOCOL_VERSION)
            .append_pair("echo", "false");

        Ok(Self {
            url,
            channel: channel.to_string(),
            client_id: client_id.to_string(),
            link: Mutex::new(None),
        })
    }

    async fn connect(&self) -> Result<Link> {
        let (mut ws, _) = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| anyhow!("Timed out connecting to Ably realtime"))?
        .context("Failed to connect to Ably realtime")?;

        expect_action(&mut ws, action::CONNECTED).await?;
        let attach = json!({
            "action": action::ATTACH,
            "channel": self.channel,
            "flags": MODE_PRESENCE,
        });
        ws.send(text_frame(&attach))
            .await
            .context("Failed to attach to Ably channel")?;
        expect_action(&mut ws, action::ATTACHED).await?;
        info!("Attached to Ably channel {} for presence", self.channel);

        let (sink, stream) = ws.split();
        let (outbound, rx) = mpsc::channel(32);
        let pending = Pending::default();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump(sink, stream, rx, pending.clone(), cancel.clone()));

        Ok(Link {
            outbound,
            pending,
            next_serial: 0,
            entered: Vec::new(),
            cancel,
            task,
        })
    }

    /// Enter `record` as a presence member, connecting first if needed
    pub async fn enter(&self, record: &PresenceRecord) -> Result<()> {
        let mut guard = self.link.lock().await;
        if let Some(link) = guard.as_ref().filter(|link| link.is_closed()) {
            warn!(
                "Ably realtime link dropped; {} presence entries are gone",
                link.entered.len()
            );
            *guard = None;
        }
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(link) = guard.as_mut() else {
            bail!("Ably realtime link unavailable");
        };

        let member = member_id(&self.client_id, &record.agent_id);
        link.send_presence(&self.channel, PRESENCE_ENTER, &member, Some(record))
            .await?;
        if !link.entered.contains(&member) {
            link.entered.push(member);
        }
        Ok(())
    }

    /// Leave every entered member and close the connection
    pub async fn leave(&self) -> Result<()> {
        let Some(mut link) = self.link.lock().await.take() else {
            return Ok(());
        };

        let mut result = Ok(());
        for member in std::mem::take(&mut link.entered) {
            if let Err(e) = link
                .send_presence(&self.channel, PRESENCE_LEAVE, &member, None)
                .await
            {
                warn!("Failed to leave presence as {}: {:#}", member, e);
                result = Err(e);
            }
        }

        link.cancel.cancel();
        if let Err(e) = link.task.await {
            warn!("Ably realtime task failed: {}", e);
        }
        result
    }
}
