//! Ably channel adapter: REST with polling, plus a realtime link for presence

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use allochory_core::types::{
    ChannelMessage, PresenceAction, PresenceEvent, PresenceRecord, now_millis,
};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::PubSubChannel;
use crate::realtime::{DEFAULT_REALTIME_URL, RealtimePresence};

const HISTORY_PAGE_LIMIT: &str = "100";
const SUBSCRIBER_BUFFER: usize = 256;

/// Message as returned by the Ably REST API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AblyMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    encoding: Option<String>,
}

impl AblyMessage {
    fn into_channel_message(self) -> ChannelMessage {
        let data = decode_data(self.data, self.encoding.as_deref());
        ChannelMessage {
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: self.name.unwrap_or_default(),
            client_id: self.client_id,
            timestamp: self.timestamp.unwrap_or_else(now_millis),
            data,
        }
    }
}

/// Presence entry as returned by the Ably REST API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AblyPresence {
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    encoding: Option<String>,
}

/// Undo the `json` encoding Ably applies to structured payloads
fn decode_data(data: Value, encoding: Option<&str>) -> Value {
    match (encoding, data) {
        (Some(enc), Value::String(raw)) if enc.split('/').any(|step| step == "json") => {
            match serde_json::from_str(&raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!("Ably payload claimed json encoding but failed to parse: {}", e);
                    Value::String(raw)
                }
            }
        }
        (_, data) => data,
    }
}

/// Body for `POST /channels/{name}/messages`
fn publish_body(name: &str, data: &Value, client_id: &str) -> Value {
    serde_json::json!({
        "name": name,
        "data": data.to_string(),
        "encoding": "json",
        "clientId": client_id,
    })
}

/// Split an Ably API key (`keyName:keySecret`) for basic auth
fn split_api_key(api_key: &str) -> Result<(String, String)> {
    match api_key.split_once(':') {
        Some((name, secret)) if !name.is_empty() && !secret.is_empty() => {
            Ok((name.to_string(), secret.to_string()))
        }
        _ => Err(anyhow!("Ably API key must have the form keyName:keySecret")),
    }
}

struct AblyRest {
    client: Client,
    rest_url: Url,
    channel: String,
    client_id: String,
    key_name: String,
    key_secret: String,
}

impl AblyRest {
    fn endpoint(&self, resource: &str) -> Result<Url> {
        let mut url = self.rest_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("Ably REST URL cannot be a base: {}", self.rest_url))?
            .pop_if_empty()
            .extend(["channels", self.channel.as_str(), resource]);
        Ok(url)
    }

    async fn get_json(&self, url: Url, query: &[(&str, String)]) -> Result<Value> {
        let response = self
            .client
            .get(url)
            .basic_auth(&self.key_name, Some(&self.key_secret))
            .query(query)
            .send()
            .await
            .context("Failed to reach Ably REST API")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Ably API HTTP error {}: {}", status, error_text));
        }

        response.json().await.context("Failed to parse Ably response")
    }

    async fn publish(&self, name: &str, data: &Value) -> Result<()> {
        let url = self.endpoint("messages")?;
        let response = self
            .client
            .post(url)
            .basic_auth(&self.key_name, Some(&self.key_secret))
            .json(&publish_body(name, data, &self.client_id))
            .send()
            .await
            .context("Failed to publish to Ably")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Ably publish failed with status {}: {}", status, error_text));
        }
        Ok(())
    }

    /// Messages published at or after `start` (ms), oldest first
    async fn history_since(&self, start: i64) -> Result<Vec<ChannelMessage>> {
        let url = self.endpoint("messages")?;
        let body = self
            .get_json(
                url,
                &[
                    ("direction", "forwards".to_string()),
                    ("start", start.to_string()),
                    ("limit", HISTORY_PAGE_LIMIT.to_string()),
                ],
            )
            .await?;
        let messages: Vec<AblyMessage> =
            serde_json::from_value(body).context("Unexpected Ably history shape")?;
        Ok(messages
            .into_iter()
            .map(AblyMessage::into_channel_message)
            .collect())
    }

    /// Presence entries keyed by `(client_id, agent_id)`
    async fn presence(&self) -> Result<Vec<(String, PresenceRecord)>> {
        let url = self.endpoint("presence")?;
        let body = self.get_json(url, &[]).await?;
        let entries: Vec<AblyPresence> =
            serde_json::from_value(body).context("Unexpected Ably presence shape")?;

        let mut records = Vec::new();
        for entry in entries {
            let data = decode_data(entry.data, entry.encoding.as_deref());
            match serde_json::from_value::<PresenceRecord>(data) {
                Ok(record) => records.push((entry.client_id.unwrap_or_default(), record)),
                Err(e) => debug!("Skipping presence entry without an agent record: {}", e),
            }
        }
        Ok(records)
    }
}

/// Ably channel adapter
///
/// Publishes and reads presence over REST; inbound messages and membership
/// changes are discovered by polling every `poll_interval`. Entering presence
/// goes through a realtime connection opened on first use.
pub struct AblyChannel {
    rest: Arc<AblyRest>,
    presence: RealtimePresence,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl AblyChannel {
    /// Create a new Ably adapter
    ///
    /// # Arguments
    /// * `rest_url` - REST endpoint, normally `https://rest.ably.io`
    /// * `channel` - channel name, e.g. `mcp:hello`
    /// * `api_key` - `keyName:keySecret`
    /// * `client_id` - identity to publish as
    /// * `poll_interval` - how often to poll for new messages and presence
    pub fn new(
        rest_url: &str,
        channel: impl Into<String>,
        api_key: &str,
        client_id: impl Into<String>,
        poll_interval: Duration,
    ) -> Result<Self> {
        if poll_interval.is_zero() {
            return Err(anyhow!("Ably poll interval must be greater than zero"));
        }
        let (key_name, key_secret) = split_api_key(api_key)?;
        let rest_url = Url::parse(rest_url)
            .with_context(|| format!("Invalid Ably REST URL: {}", rest_url))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        let channel = channel.into();
        let client_id = client_id.into();
        let presence = RealtimePresence::new(DEFAULT_REALTIME_URL, api_key, &channel, &client_id)?;

        Ok(Self {
            rest: Arc::new(AblyRest {
                client,
                rest_url,
                channel,
                client_id,
                key_name,
                key_secret,
            }),
            presence,
            poll_interval,
            cancel: CancellationToken::new(),
        })
    }

    /// Use a different realtime endpoint for presence, e.g. a regional host
    pub fn with_realtime_url(mut self, realtime_url: &str) -> Result<Self> {
        let api_key = format!("{}:{}", self.rest.key_name, self.rest.key_secret);
        self.presence =
            RealtimePresence::new(realtime_url, &api_key, &self.rest.channel, &self.rest.client_id)?;
        Ok(self)
    }
}

#[async_trait]
impl PubSubChannel for AblyChannel {
    fn name(&self) -> &str {
        &self.rest.channel
    }

    fn client_id(&self) -> &str {
        &self.rest.client_id
    }

    async fn publish(&self, name: &str, data: Value) -> Result<()> {
        debug!("Publishing [{}] to Ably channel {}", name, self.rest.channel);
        self.rest.publish(name, &data).await
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ChannelMessage>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let rest = self.rest.clone();
        let cancel = self.cancel.child_token();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            info!("Ably polling task started for {}", rest.channel);
            // Start at "now" so old messages are not replayed
            let mut cursor = now_millis();
            let mut seen_at_cursor: HashSet<String> = HashSet::new();
            let mut interval = tokio::time::interval(poll_interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let messages = match rest.history_since(cursor).await {
                    Ok(messages) => messages,
                    Err(e) => {
                        error!("Error during Ably polling cycle: {:#}", e);
                        continue;
                    }
                };

                for message in messages {
                    if message.timestamp < cursor
                        || (message.timestamp == cursor && seen_at_cursor.contains(&message.id))
                    {
                        continue;
                    }
                    if message.timestamp > cursor {
                        cursor = message.timestamp;
                        seen_at_cursor.clear();
                    }
                    seen_at_cursor.insert(message.id.clone());

                    if tx.send(message).await.is_err() {
                        debug!("Ably subscriber dropped, stopping poller");
                        return;
                    }
                }
            }
            info!("Ably polling task stopped for {}", rest.channel);
        });

        Ok(rx)
    }

    async fn enter_presence(&self, record: PresenceRecord) -> Result<()> {
        self.presence
            .enter(&record)
            .await
            .with_context(|| format!("Failed to enter presence as {}", record.agent_id))
    }

    async fn leave_presence(&self) -> Result<()> {
        self.presence.leave().await
    }

    async fn presence_members(&self) -> Result<Vec<PresenceRecord>> {
        Ok(self
            .rest
            .presence()
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    async fn subscribe_presence(&self) -> Result<mpsc::Receiver<PresenceEvent>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let rest = self.rest.clone();
        let cancel = self.cancel.child_token();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            let mut known: HashMap<(String, String), PresenceRecord> = HashMap::new();
            let mut interval = tokio::time::interval(poll_interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let current = match rest.presence().await {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!("Failed to poll Ably presence: {:#}", e);
                        continue;
                    }
                };

                let current: HashMap<(String, String), PresenceRecord> = current
                    .into_iter()
                    .map(|(client_id, record)| ((client_id, record.agent_id.clone()), record))
                    .collect();

                for event in presence_diff(&known, &current) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                known = current;
            }
        });

        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        if let Err(e) = self.presence.leave().await {
            warn!("Failed to leave Ably presence on close: {:#}", e);
        }
        info!("Closed Ably channel {}", self.rest.channel);
        Ok(())
    }
}

/// Membership events that turn `before` into `after`
fn presence_diff(
    before: &HashMap<(String, String), PresenceRecord>,
    after: &HashMap<(String, String), PresenceRecord>,
) -> Vec<PresenceEvent> {
    let mut events = Vec::new();
    for (key, record) in after {
        let action = match before.get(key) {
            None => PresenceAction::Enter,
            Some(old) if old != record => PresenceAction::Update,
            Some(_) => continue,
        };
        events.push(PresenceEvent {
            action,
            client_id: key.0.clone(),
            record: Some(record.clone()),
        });
    }
    for (key, record) in before {
        if !after.contains_key(key) {
            events.push(PresenceEvent {
                action: PresenceAction::Leave,
                client_id: key.0.clone(),
                record: Some(record.clone()),
            });
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channel() -> AblyChannel {
        AblyChannel::new(
            "https://rest.ably.io",
            "mcp:hello",
            "appId.keyId:secret",
            "u1",
            Duration::from_secs(2),
        )
        .unwrap()
    }

    #[test]
    fn test_split_api_key() {
        let (name, secret) = split_api_key("appId.keyId:s3cr3t").unwrap();
        assert_eq!(name, "appId.keyId");
        assert_eq!(secret, "s3cr3t");
        assert!(split_api_key("no-colon").is_err());
        assert!(split_api_key(":secret").is_err());
        assert!(split_api_key("name:").is_err());
    }

    #[test]
    fn test_new_rejects_bad_url() {
        let result = AblyChannel::new("not a url", "c", "a:b", "u1", Duration::from_secs(1));
        assert!(result.is_err());
    }

    #[test]
    fn test_endpoint() {
        let ch = channel();
        let url = ch.rest.endpoint("messages").unwrap();
        assert_eq!(url.host_str(), Some("rest.ably.io"));
        assert!(url.path().starts_with("/channels/mcp"));
        assert!(url.path().ends_with("hello/messages"));
        assert_eq!(ch.name(), "mcp:hello");
        assert_eq!(ch.client_id(), "u1");
    }

    #[test]
    fn test_publish_body() {
        let body = publish_body("u1", &json!({"text": "hi"}), "u1");
        assert_eq!(body["name"], "u1");
        assert_eq!(body["encoding"], "json");
        assert_eq!(body["clientId"], "u1");
        let inner: Value = serde_json::from_str(body["data"].as_str().unwrap()).unwrap();
        assert_eq!(inner["text"], "hi");
    }

    #[test]
    fn test_decode_json_encoded_message() {
        let raw = json!({
            "id": "m1",
            "name": "Agent-Request:",
            "clientId": "u1",
            "timestamp": 1000,
            "encoding": "json",
            "data": "{\"type\":\"invoke\",\"to\":\"agent:ollama\",\"tool\":\"summarize\"}"
        });
        let msg: AblyMessage = serde_json::from_value(raw).unwrap();
        let msg = msg.into_channel_message();
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.client_id.as_deref(), Some("u1"));
        assert_eq!(msg.timestamp, 1000);
        assert_eq!(msg.payload_type(), Some("invoke"));
    }

    #[test]
    fn test_decode_plain_object_and_bad_json() {
        assert_eq!(decode_data(json!({"text": "hi"}), None), json!({"text": "hi"}));
        assert_eq!(decode_data(json!("not json"), Some("json")), json!("not json"));
        assert_eq!(decode_data(json!("{\"a\":1}"), Some("utf-8/json")), json!({"a": 1}));
    }

    #[test]
    fn test_presence_diff() {
        let rec = |id: &str, status: &str| PresenceRecord {
            agent_id: id.to_string(),
            tools: vec![],
            status: status.to_string(),
        };
        let key = |c: &str, a: &str| (c.to_string(), a.to_string());

        let mut before = HashMap::new();
        before.insert(key("u1", "agent:a"), rec("agent:a", "available"));
        before.insert(key("u2", "agent:b"), rec("agent:b", "available"));

        let mut after = HashMap::new();
        after.insert(key("u1", "agent:a"), rec("agent:a", "busy"));
        after.insert(key("u3", "agent:c"), rec("agent:c", "available"));

        let events = presence_diff(&before, &after);
        assert_eq!(events.len(), 3);
        assert!(events.iter().any(|e| e.action == PresenceAction::Update && e.client_id == "u1"));
        assert!(events.iter().any(|e| e.action == PresenceAction::Enter && e.client_id == "u3"));
        assert!(events.iter().any(|e| e.action == PresenceAction::Leave && e.client_id == "u2"));

        assert!(presence_diff(&after, &after).is_empty());
    }

    #[test]
    fn test_new_rejects_zero_poll_interval() {
        let result = AblyChannel::new("https://rest.ably.io", "c", "a:b", "u1", Duration::ZERO);
        assert!(result.is_err());
    }

    #[test]
    fn test_with_realtime_url() {
        assert!(channel().with_realtime_url("wss://eu-realtime.ably.io").is_ok());
        assert!(channel().with_realtime_url("https://realtime.ably.io").is_err());
    }

    #[tokio::test]
    async fn test_enter_presence_reports_unreachable_realtime() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let ch = channel().with_realtime_url(&format!("ws://{}", addr)).unwrap();
        let record = PresenceRecord {
            agent_id: "agent:ollama".to_string(),
            tools: vec!["summarize".to_string()],
            status: "available".to_string(),
        };
        let err = ch.enter_presence(record).await.unwrap_err();
        assert!(err.to_string().contains("agent:ollama"));
        // Nothing entered, nothing to leave
        assert!(ch.leave_presence().await.is_ok());
    }
}
