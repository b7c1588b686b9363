//! Presence roster: who is online on the shared channel

use std::sync::Arc;

use allochory_core::types::PresenceRecord;
use anyhow::Result;
use tokio::sync::RwLock;
use tracing::debug;

use crate::channel::PubSubChannel;

/// Live roster, replaced wholesale on every refresh
#[derive(Debug, Clone, Default)]
pub struct Roster {
    members: Arc<RwLock<Vec<PresenceRecord>>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-read membership from the channel and replace the roster
    pub async fn refresh(&self, channel: &dyn PubSubChannel) -> Result<Vec<PresenceRecord>> {
        let members = channel.presence_members().await?;
        debug!("Roster refreshed: {} online", members.len());
        *self.members.write().await = members.clone();
        Ok(members)
    }

    pub async fn snapshot(&self) -> Vec<PresenceRecord> {
        self.members.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }
}

/// `agent_id (tool, tool)` line used when rendering the roster
pub fn format_member(record: &PresenceRecord) -> String {
    format!("{} ({})", record.agent_id, record.tools.join(", "))
}
