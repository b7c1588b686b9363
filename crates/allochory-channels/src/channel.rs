//! Shared pub/sub channel: the seam to the external messaging service

use allochory_core::types::{ChannelMessage, PresenceEvent, PresenceRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// Trait that every pub/sub adapter implements.
///
/// One value represents one participant (`client_id`) attached to one named
/// channel. Adapters echo a participant's own publishes back to its
/// subscribers, so a relay sees the invoke requests its own user sends.
#[async_trait]
pub trait PubSubChannel: Send + Sync {
    /// Name of the channel, e.g. `mcp:hello`
    fn name(&self) -> &str;

    /// Identity this participant publishes as
    fn client_id(&self) -> &str;

    /// Publish `data` under the message name `name`
    async fn publish(&self, name: &str, data: Value) -> Result<()>;

    /// Start receiving messages published from now on
    async fn subscribe(&self) -> Result<mpsc::Receiver<ChannelMessage>>;

    /// Announce a presence record for this participant
    async fn enter_presence(&self, record: PresenceRecord) -> Result<()>;

    /// Withdraw every presence record this participant announced
    async fn leave_presence(&self) -> Result<()>;

    /// Current presence records on the channel
    async fn presence_members(&self) -> Result<Vec<PresenceRecord>>;

    /// Start receiving membership-change notifications
    async fn subscribe_presence(&self) -> Result<mpsc::Receiver<PresenceEvent>>;

    /// Tear down subscriptions held by this participant
    async fn close(&self) -> Result<()>;
}

/// Serialize `payload` and publish it under `name`
pub async fn publish_payload<T: Serialize + ?Sized>(
    channel: &dyn PubSubChannel,
    name: &str,
    payload: &T,
) -> Result<()> {
    let data = serde_json::to_value(payload).context("Failed to serialize payload")?;
    channel.publish(name, data).await
}
