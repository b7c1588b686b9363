//! In-process channel: a broadcast hub shared by local participants
//!
//! Used for `--local` runs and tests. This is a fan-out, not a broker: there
//! is no persistence, no history, and slow subscribers that fall more than
//! `capacity` messages behind skip the overflow.

use std::sync::Arc;

use allochory_core::types::{ChannelMessage, PresenceAction, PresenceEvent, PresenceRecord};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::PubSubChannel;

#[derive(Debug, Clone)]
struct Member {
    client_id: String,
    record: PresenceRecord,
}

struct HubInner {
    name: String,
    capacity: usize,
    messages: broadcast::Sender<ChannelMessage>,
    presence: broadcast::Sender<PresenceEvent>,
    members: RwLock<Vec<Member>>,
}

/// A single named in-process channel
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl LocalHub {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (messages, _) = broadcast::channel(capacity);
        let (presence, _) = broadcast::channel(capacity);
        let name = name.into();
        info!("Created local channel '{}' with capacity {}", name, capacity);
        Self {
            inner: Arc::new(HubInner {
                name,
                capacity,
                messages,
                presence,
                members: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Attach a participant to the hub
    pub fn connect(&self, client_id: impl Into<String>) -> LocalChannel {
        LocalChannel {
            hub: self.clone(),
            client_id: client_id.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

/// One participant's handle on a [`LocalHub`]
pub struct LocalChannel {
    hub: LocalHub,
    client_id: String,
    cancel: CancellationToken,
}

/// Forward a broadcast stream into an mpsc receiver until cancelled
fn forward<T: Clone + Send + 'static>(
    mut source: broadcast::Receiver<T>,
    capacity: usize,
    cancel: CancellationToken,
    label: &'static str,
) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(capacity);
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = source.recv() => item,
            };
            match item {
                Ok(item) => {
                    if tx.send(item).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Local {} subscriber lagged, skipped {} items", label, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Local {} forwarder stopped", label);
    });
    rx
}

#[async_trait]
impl PubSubChannel for LocalChannel {
    fn name(&self) -> &str {
        self.hub.name()
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn publish(&self, name: &str, data: Value) -> Result<()> {
        let message = ChannelMessage::new(name, Some(self.client_id.clone()), data);
        debug!("Local publish [{}] from {}", name, self.client_id);
        // No subscribers is not an error
        let _ = self.hub.inner.messages.send(message);
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ChannelMessage>> {
        let source = self.hub.inner.messages.subscribe();
        Ok(forward(
            source,
            self.hub.inner.capacity,
            self.cancel.child_token(),
            "message",
        ))
    }

    async fn enter_presence(&self, record: PresenceRecord) -> Result<()> {
        let action = {
            let mut members = self.hub.inner.members.write().await;
            match members
                .iter_mut()
                .find(|m| m.client_id == self.client_id && m.record.agent_id == record.agent_id)
            {
                Some(existing) => {
                    existing.record = record.clone();
                    PresenceAction::Update
                }
                None => {
                    members.push(Member {
                        client_id: self.client_id.clone(),
                        record: record.clone(),
                    });
                    PresenceAction::Enter
                }
            }
        };
        debug!("Presence {} for {} ({})", action, self.client_id, record.agent_id);
        let _ = self.hub.inner.presence.send(PresenceEvent {
            action,
            client_id: self.client_id.clone(),
            record: Some(record),
        });
        Ok(())
    }

    async fn leave_presence(&self) -> Result<()> {
        let removed: Vec<Member> = {
            let mut members = self.hub.inner.members.write().await;
            let (mine, others): (Vec<Member>, Vec<Member>) = members
                .drain(..)
                .partition(|m| m.client_id == self.client_id);
            *members = others;
            mine
        };
        for member in removed {
            debug!("Presence leave for {} ({})", member.client_id, member.record.agent_id);
            let _ = self.hub.inner.presence.send(PresenceEvent {
                action: PresenceAction::Leave,
                client_id: member.client_id,
                record: Some(member.record),
            });
        }
        Ok(())
    }

    async fn presence_members(&self) -> Result<Vec<PresenceRecord>> {
        let members = self.hub.inner.members.read().await;
        Ok(members.iter().map(|m| m.record.clone()).collect())
    }

    async fn subscribe_presence(&self) -> Result<mpsc::Receiver<PresenceEvent>> {
        let source = self.hub.inner.presence.subscribe();
        Ok(forward(
            source,
            self.hub.inner.capacity,
            self.cancel.child_token(),
            "presence",
        ))
    }

    async fn close(&self) -> Result<()> {
        self.leave_presence().await?;
        self.cancel.cancel();
        info!("Local participant {} disconnected from '{}'", self.client_id, self.hub.name());
        Ok(())
    }
}
