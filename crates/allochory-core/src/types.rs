//! Shared types for allochory-core
//!
//! Everything that travels over the shared channel is defined here: the
//! channel envelope, the chat and invoke payloads, agent responses and
//! presence records.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminator value that marks a payload as an invocation request
pub const INVOKE_TYPE: &str = "invoke";

/// Message name used for invocation requests
pub const REQUEST_NAME: &str = "Agent-Request:";

/// Message name used for the greeting published after connecting
pub const GREETING_NAME: &str = "greeting";

/// Presence status announced for every registered agent
pub const STATUS_AVAILABLE: &str = "available";

/// Message name for a response produced by `agent_id`
pub fn response_name(agent_id: &str) -> String {
    format!("Agent-Response ({}):", agent_id)
}

/// Message name for a failure report about `agent_id`
pub fn error_name(agent_id: &str) -> String {
    format!("Agent-Error ({}):", agent_id)
}

/// Current time in milliseconds since the epoch
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// A message as delivered by (or published to) the shared channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelMessage {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Milliseconds since the epoch
    pub timestamp: i64,
    #[serde(default)]
    pub data: Value,
}

impl ChannelMessage {
    pub fn new(name: impl Into<String>, client_id: Option<String>, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            client_id,
            timestamp: now_millis(),
            data,
        }
    }

    /// The `type` discriminator of the payload, if any
    pub fn payload_type(&self) -> Option<&str> {
        self.data.get("type").and_then(Value::as_str)
    }
}

/// Plain chat payload: `{ text, from, timestamp }`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl ChatPayload {
    pub fn new(text: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            from: Some(from.into()),
            timestamp: Some(now_millis()),
        }
    }

    /// A bare `{ text }` payload, used for greetings
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            from: None,
            timestamp: None,
        }
    }
}

/// Invocation request payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvokeRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub tool: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl InvokeRequest {
    /// Build a request asking `to` to run `tool` on `text`, with a fresh conversation id
    pub fn new(
        tool: impl Into<String>,
        text: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            kind: INVOKE_TYPE.to_string(),
            tool: tool.into(),
            input: serde_json::json!({ "text": text.into() }),
            from: Some(from.into()),
            to: to.into(),
            conversation_id: Some(uuid::Uuid::new_v4().to_string()),
        }
    }
}

/// A row of the visible chat history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatEntry {
    pub name: String,
    pub text: Option<String>,
    pub from: Option<String>,
    pub timestamp: i64,
}

impl ChatEntry {
    pub fn from_message(message: &ChannelMessage) -> Self {
        let data = &message.data;
        Self {
            name: message.name.clone(),
            text: data.get("text").and_then(Value::as_str).map(str::to_string),
            from: data
                .get("from")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| message.client_id.clone()),
            timestamp: data
                .get("timestamp")
                .and_then(Value::as_i64)
                .unwrap_or(message.timestamp),
        }
    }
}

impl std::fmt::Display for ChatEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.text.as_deref().unwrap_or(""))
    }
}

/// Payload of a successful agent response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponsePayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// An outbound response to publish on the shared channel
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    pub name: String,
    pub payload: ResponsePayload,
}

impl AgentResponse {
    pub fn new(agent_id: &str, text: String, conversation_id: Option<String>) -> Self {
        Self {
            name: response_name(agent_id),
            payload: ResponsePayload {
                text,
                conversation_id,
            },
        }
    }
}

/// Structured failure report, only published when error replies are enabled
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub error: ErrorBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// Presence entry announced by a participant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceRecord {
    pub agent_id: String,
    #[serde(default)]
    pub tools: Vec<String>,
    pub status: String,
}

/// Membership change on the shared channel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    Enter,
    Update,
    Leave,
}

impl std::fmt::Display for PresenceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enter => write!(f, "enter"),
            Self::Update => write!(f, "update"),
            Self::Leave => write!(f, "leave"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceEvent {
    pub action: PresenceAction,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<PresenceRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_request_wire_shape() {
        let req = InvokeRequest::new("summarize", "hello", "u1", "agent:ollama");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "invoke");
        assert_eq!(json["tool"], "summarize");
        assert_eq!(json["input"]["text"], "hello");
        assert_eq!(json["from"], "u1");
        assert_eq!(json["to"], "agent:ollama");
        assert!(json["conversation_id"].is_string());
    }

    #[test]
    fn test_chat_payload_wire_shape() {
        let payload = ChatPayload::new("hi", "u1");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["text"], "hi");
        assert_eq!(json["from"], "u1");
        assert!(json["timestamp"].is_i64());

        let greeting = serde_json::to_value(ChatPayload::text_only("Hello")).unwrap();
        assert_eq!(greeting, serde_json::json!({"text": "Hello"}));
    }

    #[test]
    fn test_payload_type() {
        let plain = ChannelMessage::new("u1", None, serde_json::json!({"text": "hi"}));
        assert_eq!(plain.payload_type(), None);

        let invoke = ChannelMessage::new(REQUEST_NAME, None, serde_json::json!({"type": "invoke"}));
        assert_eq!(invoke.payload_type(), Some("invoke"));
    }

    #[test]
    fn test_chat_entry_from_message() {
        let msg = ChannelMessage::new(
            "u1",
            Some("client-1".to_string()),
            serde_json::json!({"text": "hi", "from": "u1", "timestamp": 1000}),
        );
        let entry = ChatEntry::from_message(&msg);
        assert_eq!(entry.text.as_deref(), Some("hi"));
        assert_eq!(entry.from.as_deref(), Some("u1"));
        assert_eq!(entry.timestamp, 1000);
        assert_eq!(entry.to_string(), "u1: hi");
    }

    #[test]
    fn test_chat_entry_falls_back_to_client_id() {
        let msg = ChannelMessage::new(
            GREETING_NAME,
            Some("client-1".to_string()),
            serde_json::json!({"text": "Hello from client-1!"}),
        );
        let entry = ChatEntry::from_message(&msg);
        assert_eq!(entry.from.as_deref(), Some("client-1"));
        assert_eq!(entry.timestamp, msg.timestamp);
    }

    #[test]
    fn test_chat_entry_without_text() {
        let msg = ChannelMessage::new("odd", None, serde_json::json!({"other": 1}));
        assert_eq!(ChatEntry::from_message(&msg).to_string(), "odd: ");
    }

    #[test]
    fn test_response_name() {
        let resp = AgentResponse::new("agent:ollama", "done".to_string(), None);
        assert_eq!(resp.name, "Agent-Response (agent:ollama):");
        let json = serde_json::to_value(&resp.payload).unwrap();
        assert_eq!(json, serde_json::json!({"text": "done"}));
    }

    #[test]
    fn test_presence_record_serialization() {
        let record = PresenceRecord {
            agent_id: "agent:ollama".to_string(),
            tools: vec!["summarize".to_string()],
            status: STATUS_AVAILABLE.to_string(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"agent_id": "agent:ollama", "tools": ["summarize"], "status": "available"})
        );
    }
}
