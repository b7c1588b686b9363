//! Message dispatcher: classifies inbound channel messages and runs invocations
//!
//! Each message is handled on its own: classify by the `type` discriminator,
//! then either hand it back for display or resolve the target agent and invoke
//! the requested tool. The dispatcher keeps no state between messages, so
//! callers may run many dispatches concurrently; completions (and therefore
//! published responses) carry no ordering guarantee.

use std::sync::Arc;
use tracing::{debug, info};

use crate::agents::AgentRegistry;
use crate::error::DispatchError;
use crate::types::{AgentResponse, ChannelMessage, ChatEntry, INVOKE_TYPE, InvokeRequest};

/// Classified inbound payload
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Chat(ChatEntry),
    Invoke(InvokeRequest),
}

/// Terminal state of a successful dispatch
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Plain message: surface it in the history unchanged
    Display(ChatEntry),
    /// Invocation succeeded: publish this response on the same channel
    Respond(AgentResponse),
}

/// Stateless dispatcher over a shared, read-only agent registry
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<AgentRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Split a message into chat or invoke without touching the registry
    pub fn classify(message: &ChannelMessage) -> Result<Inbound, DispatchError> {
        if message.payload_type() == Some(INVOKE_TYPE) {
            let request: InvokeRequest = serde_json::from_value(message.data.clone())?;
            Ok(Inbound::Invoke(request))
        } else {
            Ok(Inbound::Chat(ChatEntry::from_message(message)))
        }
    }

    /// Classify `message` and, for invocations, run the target agent
    pub async fn dispatch(&self, message: &ChannelMessage) -> Result<DispatchOutcome, DispatchError> {
        match Self::classify(message)? {
            Inbound::Chat(entry) => {
                debug!("Message '{}' is plain chat", message.name);
                Ok(DispatchOutcome::Display(entry))
            }
            Inbound::Invoke(request) => self.invoke(&request).await.map(DispatchOutcome::Respond),
        }
    }

    /// Resolve `request.to` and invoke `request.tool` on it
    pub async fn invoke(&self, request: &InvokeRequest) -> Result<AgentResponse, DispatchError> {
        let agent = self
            .registry
            .find(&request.to)
            .ok_or_else(|| DispatchError::UnknownAgent(request.to.clone()))?;

        info!(
            "Invoking '{}' on '{}' (from: {}, conversation: {})",
            request.tool,
            request.to,
            request.from.as_deref().unwrap_or("unknown"),
            request.conversation_id.as_deref().unwrap_or("-")
        );

        let text = agent
            .invoke(&request.input, &request.tool)
            .await
            .map_err(|error| DispatchError::Invoke {
                agent: request.to.clone(),
                tool: request.tool.clone(),
                error,
            })?;

        Ok(AgentResponse::new(
            &request.to,
            text,
            request.conversation_id.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{Agent, AgentBackend, AgentDescriptor};
    use crate::error::InvokeError;
    use crate::ollama::OllamaClient;
    use crate::test_support::{refused_url, serve_once};
    use crate::types::REQUEST_NAME;
    use serde_json::json;

    fn dispatcher_with_ollama(base_url: String) -> Dispatcher {
        let mut registry = AgentRegistry::new();
        registry.register(Agent::new(
            AgentDescriptor::new("agent:ollama", "Ollama")
                .with_description("A simple agent that can summarize text.")
                .with_tools(["summarize"]),
            AgentBackend::Ollama(OllamaClient::new(base_url, "llama3").unwrap()),
        ));
        Dispatcher::new(Arc::new(registry))
    }

    fn invoke_message(to: &str, tool: &str) -> ChannelMessage {
        ChannelMessage::new(
            REQUEST_NAME,
            Some("u1".to_string()),
            json!({
                "type": "invoke",
                "tool": tool,
                "to": to,
                "input": {"text": "hello"},
                "from": "u1",
                "conversation_id": "conv-1",
            }),
        )
    }

    #[tokio::test]
    async fn test_valid_invoke_responds_with_generation() {
        let (url, request) = serve_once("200 OK", r#"{"response":"generated for hello"}"#).await;
        let dispatcher = dispatcher_with_ollama(url);

        let outcome = dispatcher.dispatch(&invoke_message("agent:ollama", "summarize")).await.unwrap();
        match outcome {
            DispatchOutcome::Respond(resp) => {
                assert_eq!(resp.name, "Agent-Response (agent:ollama):");
                assert_eq!(resp.payload.text, "generated for hello");
                assert_eq!(resp.payload.conversation_id.as_deref(), Some("conv-1"));
            }
            other => panic!("expected Respond, got {:?}", other),
        }
        assert!(request.await.unwrap().contains(r#""prompt":"hello""#));
    }

    #[tokio::test]
    async fn test_unsupported_tool_reported() {
        let dispatcher = dispatcher_with_ollama(refused_url().await);
        let err = dispatcher.dispatch(&invoke_message("agent:ollama", "classify")).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Invoke { error: InvokeError::UnsupportedTool { .. }, .. }
        ));
        assert_eq!(err.kind(), "unsupported_tool");
    }

    #[tokio::test]
    async fn test_unknown_agent_reported() {
        let dispatcher = dispatcher_with_ollama(refused_url().await);
        let err = dispatcher.dispatch(&invoke_message("agent:unknown", "summarize")).await.unwrap_err();
        assert!(matches!(err, DispatchError::UnknownAgent(ref id) if id == "agent:unknown"));
    }

    #[tokio::test]
    async fn test_backend_failure_reported() {
        let dispatcher = dispatcher_with_ollama(refused_url().await);
        let err = dispatcher.dispatch(&invoke_message("agent:ollama", "summarize")).await.unwrap_err();
        assert_eq!(err.kind(), "backend_failure");
    }

    #[tokio::test]
    async fn test_plain_chat_displayed() {
        // Empty registry: a plain message must never need one
        let dispatcher = Dispatcher::new(Arc::new(AgentRegistry::new()));
        let msg = ChannelMessage::new("u1", None, json!({"text": "hi", "from": "u1", "timestamp": 1000}));

        match dispatcher.dispatch(&msg).await.unwrap() {
            DispatchOutcome::Display(entry) => {
                assert_eq!(entry.text.as_deref(), Some("hi"));
                assert_eq!(entry.timestamp, 1000);
            }
            other => panic!("expected Display, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_other_type_is_chat() {
        let msg = ChannelMessage::new("x", None, json!({"type": "status", "text": "busy"}));
        assert!(matches!(Dispatcher::classify(&msg).unwrap(), Inbound::Chat(_)));
    }

    #[test]
    fn test_classify_malformed_invoke() {
        let msg = ChannelMessage::new(REQUEST_NAME, None, json!({"type": "invoke", "tool": "summarize"}));
        let err = Dispatcher::classify(&msg).unwrap_err();
        assert!(matches!(err, DispatchError::MalformedInvoke(_)));
    }

    #[test]
    fn test_classify_invoke() {
        let msg = invoke_message("agent:ollama", "summarize");
        match Dispatcher::classify(&msg).unwrap() {
            Inbound::Invoke(req) => {
                assert_eq!(req.to, "agent:ollama");
                assert_eq!(req.tool, "summarize");
                assert_eq!(req.input["text"], "hello");
            }
            other => panic!("expected Invoke, got {:?}", other),
        }
    }
}
