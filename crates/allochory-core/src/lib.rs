//! allochory-core - agents and the invocation protocol
//!
//! This crate provides:
//! - Agent descriptors, backends, and the agent registry
//! - The message dispatcher that classifies chat vs. invoke messages
//! - Ollama generate client used by the Ollama backend
//! - Wire types shared by channel adapters
//! - Append-only chat history

pub mod agents;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod ollama;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use agents::{Agent, AgentBackend, AgentDescriptor, AgentRegistry};
pub use dispatcher::{DispatchOutcome, Dispatcher, Inbound};
pub use error::{DispatchError, InvokeError};
pub use history::ChatHistory;
pub use ollama::OllamaClient;
pub use types::{
    AgentResponse, ChannelMessage, ChatEntry, ChatPayload, InvokeRequest, PresenceAction,
    PresenceEvent, PresenceRecord,
};
