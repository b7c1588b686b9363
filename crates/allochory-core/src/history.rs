//! Chat history: append-only log of displayed messages

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::types::ChatEntry;

/// Shared, append-only chat history
#[derive(Debug, Clone, Default)]
pub struct ChatHistory {
    entries: Arc<RwLock<Vec<ChatEntry>>>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, returning the new length
    pub async fn append(&self, entry: ChatEntry) -> usize {
        let mut entries = self.entries.write().await;
        entries.push(entry);
        debug!("History now holds {} messages", entries.len());
        entries.len()
    }

    /// Copy of all entries, oldest first
    pub async fn snapshot(&self) -> Vec<ChatEntry> {
        self.entries.read().await.clone()
    }

    /// The last `n` entries, oldest first
    pub async fn tail(&self, n: usize) -> Vec<ChatEntry> {
        let entries = self.entries.read().await;
        let start = entries.len().saturating_sub(n);
        entries[start..].to_vec()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
