//! Error taxonomy for agent invocation and dispatch

use thiserror::Error;

/// Failure of a single agent capability call
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("unsupported tool '{tool}' for agent '{agent}'")]
    UnsupportedTool { agent: String, tool: String },

    #[error("invalid input for tool '{tool}': {reason}")]
    InvalidInput { tool: String, reason: String },

    /// Display carries the whole context chain, so no source is exposed
    #[error("inference backend failed: {0:#}")]
    Backend(anyhow::Error),
}

impl InvokeError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedTool { .. } => "unsupported_tool",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Backend(_) => "backend_failure",
        }
    }
}

/// Failure of one inbound message's dispatch
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("agent not found: {0}")]
    UnknownAgent(String),

    #[error("malformed invoke request: {0}")]
    MalformedInvoke(#[from] serde_json::Error),

    #[error("agent '{agent}' failed on '{tool}': {error}")]
    Invoke {
        agent: String,
        tool: String,
        error: InvokeError,
    },
}

impl DispatchError {
    /// Stable identifier used in structured error replies
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownAgent(_) => "unknown_agent",
            Self::MalformedInvoke(_) => "malformed_invoke",
            Self::Invoke { error, .. } => error.kind(),
        }
    }
}
