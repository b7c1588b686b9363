//! Relay: runs the dispatcher against a shared channel
//!
//! Every inbound message is handled in its own task, so a slow agent only
//! holds up its own request. Responses are published as each invocation
//! completes; two requests arriving together may be answered in either order.

use std::sync::Arc;

use allochory_core::dispatcher::{Dispatcher, Inbound};
use allochory_core::error::DispatchError;
use allochory_core::history::ChatHistory;
use allochory_core::types::{
    ChannelMessage, ChatEntry, ChatPayload, ErrorBody, ErrorPayload, GREETING_NAME,
    InvokeRequest, PresenceRecord, error_name,
};
use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{PubSubChannel, publish_payload};
use crate::presence::Roster;

const EVENT_CAPACITY: usize = 256;

/// Something the UI may want to render
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    MessageAppended(ChatEntry),
    ResponsePublished { name: String, text: String },
    DispatchFailed { kind: String, message: String },
    RosterChanged(Vec<PresenceRecord>),
}

#[derive(Debug, Clone, Default)]
pub struct RelayOptions {
    /// Publish an `Agent-Error (<id>):` message when an invocation fails
    pub publish_errors: bool,
    /// Text published under `greeting` after connecting
    pub greeting: Option<String>,
}

pub struct Relay {
    channel: Arc<dyn PubSubChannel>,
    dispatcher: Dispatcher,
    history: ChatHistory,
    roster: Roster,
    events: broadcast::Sender<RelayEvent>,
    options: RelayOptions,
}

impl Relay {
    pub fn new(channel: Arc<dyn PubSubChannel>, dispatcher: Dispatcher, options: RelayOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            channel,
            dispatcher,
            history: ChatHistory::new(),
            roster: Roster::new(),
            events,
            options,
        }
    }

    pub fn channel(&self) -> &Arc<dyn PubSubChannel> {
        &self.channel
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Subscribe to UI events
    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RelayEvent) {
        // No UI attached is fine
        let _ = self.events.send(event);
    }

    /// Enter presence for every registered agent, returning how many succeeded
    pub async fn announce(&self) -> usize {
        let mut entered = 0;
        for descriptor in self.dispatcher.registry().list() {
            match self.channel.enter_presence(descriptor.presence_record()).await {
                Ok(()) => {
                    info!("Entered presence as {}", descriptor.id);
                    entered += 1;
                }
                Err(e) => warn!("Failed to enter presence for {}: {:#}", descriptor.id, e),
            }
        }
        entered
    }

    /// Publish the configured greeting, if any
    pub async fn greet(&self) -> Result<()> {
        if let Some(text) = &self.options.greeting {
            publish_payload(self.channel.as_ref(), GREETING_NAME, &ChatPayload::text_only(text.clone()))
                .await?;
        }
        Ok(())
    }

    /// Re-read presence and notify the UI
    pub async fn refresh_roster(&self) {
        match self.roster.refresh(self.channel.as_ref()).await {
            Ok(members) => self.emit(RelayEvent::RosterChanged(members)),
            Err(e) => warn!("Failed to refresh presence roster: {:#}", e),
        }
    }

    /// Handle a single inbound message to completion
    pub async fn handle(&self, message: ChannelMessage) {
        debug!("Received message [{}]: {}", message.name, message.data);

        let inbound = match Dispatcher::classify(&message) {
            Ok(inbound) => inbound,
            Err(e) => {
                self.report(&e, None).await;
                return;
            }
        };

        match inbound {
            Inbound::Chat(entry) => {
                self.history.append(entry.clone()).await;
                self.emit(RelayEvent::MessageAppended(entry));
            }
            Inbound::Invoke(request) => {
                info!("Handling invoke request for '{}' ({})", request.to, request.tool);
                match self.dispatcher.invoke(&request).await {
                    Ok(response) => {
                        if let Err(e) =
                            publish_payload(self.channel.as_ref(), &response.name, &response.payload).await
                        {
                            error!("Failed to publish response for {}: {:#}", request.to, e);
                            self.emit(RelayEvent::DispatchFailed {
                                kind: "publish_failed".to_string(),
                                message: format!("{:#}", e),
                            });
                            return;
                        }
                        info!(
                            "Published {} ({} chars)",
                            response.name,
                            response.payload.text.len()
                        );
                        self.emit(RelayEvent::ResponsePublished {
                            name: response.name,
                            text: response.payload.text,
                        });
                    }
                    Err(e) => self.report(&e, Some(&request)).await,
                }
            }
        }
    }

    async fn report(&self, err: &DispatchError, request: Option<&InvokeRequest>) {
        error!("Dispatch failed ({}): {}", err.kind(), err);
        self.emit(RelayEvent::DispatchFailed {
            kind: err.kind().to_string(),
            message: err.to_string(),
        });

        if !self.options.publish_errors {
            return;
        }
        // Only the host of `to` answers; unknown agents may live on another node
        if !matches!(err, DispatchError::Invoke { .. }) {
            return;
        }
        let Some(request) = request else {
            return;
        };
        let payload = ErrorPayload {
            error: ErrorBody {
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
            conversation_id: request.conversation_id.clone(),
        };
        if let Err(e) = publish_payload(self.channel.as_ref(), &error_name(&request.to), &payload).await {
            error!("Failed to publish error reply for {}: {:#}", request.to, e);
        }
    }

    /// Run until `cancel` fires or the channel closes, then drain in-flight dispatches
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut messages = self.channel.subscribe().await?;
        let mut presence = self.channel.subscribe_presence().await?;
        let mut presence_open = true;
        self.refresh_roster().await;

        // Subscribed first so our own greeting shows up in history
        if let Err(e) = self.greet().await {
            warn!("Failed to publish greeting: {:#}", e);
        }

        let mut join_set = JoinSet::new();
        info!("Relay listening on {}", self.channel.name());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Relay shutting down");
                    break;
                }
                msg = messages.recv() => {
                    match msg {
                        Some(message) => {
                            let relay = self.clone();
                            join_set.spawn(async move { relay.handle(message).await });
                        }
                        None => {
                            info!("Channel subscription closed");
                            break;
                        }
                    }
                }
                event = presence.recv(), if presence_open => {
                    match event {
                        Some(event) => {
                            debug!("Presence {} from {}", event.action, event.client_id);
                            self.refresh_roster().await;
                        }
                        None => {
                            warn!("Presence subscription closed; roster will no longer update");
                            presence_open = false;
                        }
                    }
                }
                Some(joined) = join_set.join_next(), if !join_set.is_empty() => {
                    if let Err(e) = joined {
                        error!("Dispatch task failed: {}", e);
                    }
                }
            }
        }

        while join_set.join_next().await.is_some() {}

        if let Err(e) = self.channel.leave_presence().await {
            warn!("Failed to leave presence: {:#}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalHub;
    use allochory_core::agents::{Agent, AgentBackend, AgentDescriptor, AgentRegistry};
    use allochory_core::ollama::OllamaClient;
    use allochory_core::types::{REQUEST_NAME, response_name};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn registry() -> Arc<AgentRegistry> {
        let mut registry = AgentRegistry::new();
        registry.register(Agent::new(
            AgentDescriptor::new("agent:echo", "Echo").with_tools(["summarize"]),
            AgentBackend::Echo,
        ));
        Arc::new(registry)
    }

    fn relay(hub: &LocalHub, options: RelayOptions) -> Arc<Relay> {
        let channel: Arc<dyn PubSubChannel> = Arc::new(hub.connect("relay"));
        Arc::new(Relay::new(channel, Dispatcher::new(registry()), options))
    }

    fn invoke(to: &str, tool: &str) -> ChannelMessage {
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

    /// Everything published on the hub within a short quiet period
    async fn drain(rx: &mut mpsc::Receiver<ChannelMessage>) -> Vec<ChannelMessage> {
        let mut out = Vec::new();
        while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_valid_invoke_publishes_exactly_one_response() {
        let hub = LocalHub::new("mcp:hello", 16);
        let mut observed = hub.connect("observer").subscribe().await.unwrap();
        let relay = relay(&hub, RelayOptions::default());

        relay.handle(invoke("agent:echo", "summarize")).await;

        let published = drain(&mut observed).await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].name, response_name("agent:echo"));
        assert_eq!(published[0].data["text"], "tool: summarize, input: hello");
        assert_eq!(published[0].data["conversation_id"], "conv-1");
    }

    #[tokio::test]
    async fn test_unknown_agent_publishes_nothing() {
        let hub = LocalHub::new("mcp:hello", 16);
        let mut observed = hub.connect("observer").subscribe().await.unwrap();
        let relay = relay(&hub, RelayOptions::default());
        let mut events = relay.subscribe_events();

        relay.handle(invoke("agent:unknown", "summarize")).await;

        assert!(drain(&mut observed).await.is_empty());
        match events.recv().await.unwrap() {
            RelayEvent::DispatchFailed { kind, .. } => assert_eq!(kind, "unknown_agent"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsupported_tool_publishes_nothing() {
        let hub = LocalHub::new("mcp:hello", 16);
        let mut observed = hub.connect("observer").subscribe().await.unwrap();
        let relay = relay(&hub, RelayOptions::default());
        let mut events = relay.subscribe_events();

        relay.handle(invoke("agent:echo", "classify")).await;

        assert!(drain(&mut observed).await.is_empty());
        match events.recv().await.unwrap() {
            RelayEvent::DispatchFailed { kind, .. } => assert_eq!(kind, "unsupported_tool"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_replies_when_enabled() {
        let hub = LocalHub::new("mcp:hello", 16);
        let mut observed = hub.connect("observer").subscribe().await.unwrap();
        let options = RelayOptions {
            publish_errors: true,
            greeting: None,
        };
        let relay = relay(&hub, options);

        relay.handle(invoke("agent:echo", "classify")).await;

        let published = drain(&mut observed).await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].name, "Agent-Error (agent:echo):");
        assert_eq!(published[0].data["error"]["kind"], "unsupported_tool");
        assert_eq!(published[0].data["conversation_id"], "conv-1");
    }

    #[tokio::test]
    async fn test_unknown_agent_never_replies_even_with_error_replies() {
        let hub = LocalHub::new("mcp:hello", 16);
        let mut observed = hub.connect("observer").subscribe().await.unwrap();
        let options = RelayOptions {
            publish_errors: true,
            greeting: None,
        };
        let relay = relay(&hub, options);
        let mut events = relay.subscribe_events();

        relay.handle(invoke("agent:unknown", "summarize")).await;

        assert!(drain(&mut observed).await.is_empty());
        match events.recv().await.unwrap() {
            RelayEvent::DispatchFailed { kind, .. } => assert_eq!(kind, "unknown_agent"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_plain_chat_appended_to_history() {
        let hub = LocalHub::new("mcp:hello", 16);
        let mut observed = hub.connect("observer").subscribe().await.unwrap();
        let relay = relay(&hub, RelayOptions::default());

        let msg = ChannelMessage::new("u1", None, json!({"text": "hi", "from": "u1", "timestamp": 1000}));
        relay.handle(msg).await;

        let history = relay.history().snapshot().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].to_string(), "u1: hi");
        assert_eq!(history[0].timestamp, 1000);
        assert!(drain(&mut observed).await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_invoke_reported() {
        let hub = LocalHub::new("mcp:hello", 16);
        let relay = relay(&hub, RelayOptions::default());
        let mut events = relay.subscribe_events();

        relay
            .handle(ChannelMessage::new(REQUEST_NAME, None, json!({"type": "invoke"})))
            .await;

        assert!(relay.history().is_empty().await);
        match events.recv().await.unwrap() {
            RelayEvent::DispatchFailed { kind, .. } => assert_eq!(kind, "malformed_invoke"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_announce_and_greet() {
        let hub = LocalHub::new("mcp:hello", 16);
        let observer = hub.connect("observer");
        let mut observed = observer.subscribe().await.unwrap();
        let relay = relay(
            &hub,
            RelayOptions {
                publish_errors: false,
                greeting: Some("Hello from relay!".to_string()),
            },
        );

        assert_eq!(relay.announce().await, 1);
        let members = observer.presence_members().await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].agent_id, "agent:echo");
        assert_eq!(members[0].status, "available");

        relay.greet().await.unwrap();
        let published = drain(&mut observed).await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].name, "greeting");
        assert_eq!(published[0].data, json!({"text": "Hello from relay!"}));
    }

    #[tokio::test]
    async fn test_hung_backend_does_not_block_chat() {
        // Accepts connections and never answers them
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let mut registry = AgentRegistry::new();
        registry.register(Agent::new(
            AgentDescriptor::new("agent:slow", "Slow").with_tools(["summarize"]),
            AgentBackend::Ollama(
                OllamaClient::with_timeout(&format!("http://{}", addr), "llama3", Duration::from_secs(30))
                    .unwrap(),
            ),
        ));
        let hub = LocalHub::new("mcp:hello", 64);
        let user = hub.connect("u1");
        let channel: Arc<dyn PubSubChannel> = Arc::new(hub.connect("relay"));
        let relay = Arc::new(Relay::new(
            channel,
            Dispatcher::new(Arc::new(registry)),
            RelayOptions::default(),
        ));

        let cancel = CancellationToken::new();
        let running = tokio::spawn(relay.clone().run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let request = InvokeRequest::new("summarize", "hello", "u1", "agent:slow");
        user.publish(REQUEST_NAME, serde_json::to_value(request).unwrap())
            .await
            .unwrap();
        user.publish("u1", json!({"text": "after", "from": "u1", "timestamp": 1000}))
            .await
            .unwrap();

        let arrived = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let history = relay.history().snapshot().await;
                if history.iter().any(|e| e.text.as_deref() == Some("after")) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(arrived.is_ok(), "chat was held up behind the pending invoke");

        running.abort();
    }

    #[tokio::test]
    async fn test_run_end_to_end() {
        let hub = LocalHub::new("mcp:hello", 64);
        let user = hub.connect("u1");
        let mut observed = user.subscribe().await.unwrap();
        let relay = relay(&hub, RelayOptions::default());
        relay.announce().await;

        let cancel = CancellationToken::new();
        let running = tokio::spawn(relay.clone().run(cancel.clone()));
        // Let the relay subscribe before publishing
        tokio::time::sleep(Duration::from_millis(50)).await;

        user.publish("u1", json!({"text": "hi", "from": "u1", "timestamp": 1000}))
            .await
            .unwrap();
        user.publish(REQUEST_NAME, serde_json::to_value(InvokeRequest::new("summarize", "hello", "u1", "agent:echo")).unwrap())
            .await
            .unwrap();

        let response = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let msg = observed.recv().await.unwrap();
                if msg.name == response_name("agent:echo") {
                    return msg;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(response.data["text"], "tool: summarize, input: hello");

        cancel.cancel();
        running.await.unwrap().unwrap();

        // Chat and the response itself are plain messages
        let history = relay.history().snapshot().await;
        assert!(history.iter().any(|e| e.text.as_deref() == Some("hi")));
        assert!(user.presence_members().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_roster_refresh_emits_event() {
        let hub = LocalHub::new("mcp:hello", 16);
        let relay = relay(&hub, RelayOptions::default());
        let mut events = relay.subscribe_events();
        relay.announce().await;

        relay.refresh_roster().await;
        match events.recv().await.unwrap() {
            RelayEvent::RosterChanged(members) => assert_eq!(members.len(), 1),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(relay.roster().len().await, 1);
    }
}
