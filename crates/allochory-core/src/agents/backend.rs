//! Invocation backends and the agent capability contract

use serde_json::Value;
use tracing::{debug, warn};

use super::descriptor::AgentDescriptor;
use crate::error::InvokeError;
use crate::ollama::OllamaClient;

/// Tool name for text summarization
pub const SUMMARIZE: &str = "summarize";

/// Closed set of backend kinds; adding a backend means adding a variant here
#[derive(Debug, Clone)]
pub enum AgentBackend {
    /// Forwards `summarize` to a local Ollama server
    Ollama(OllamaClient),
    /// Answers every declared tool with `tool: <tool>, input: <text>`
    Echo,
}

impl AgentBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ollama(_) => "ollama",
            Self::Echo => "echo",
        }
    }

    async fn call(&self, agent_id: &str, input: &Value, tool: &str) -> Result<String, InvokeError> {
        match self {
            Self::Ollama(client) => match tool {
                SUMMARIZE => {
                    let prompt = input_text(input).ok_or_else(|| InvokeError::InvalidInput {
                        tool: tool.to_string(),
                        reason: "expected a string or an object with a string `text` field"
                            .to_string(),
                    })?;
                    client.generate(prompt).await.map_err(InvokeError::Backend)
                }
                _ => Err(InvokeError::UnsupportedTool {
                    agent: agent_id.to_string(),
                    tool: tool.to_string(),
                }),
            },
            Self::Echo => {
                let shown = input_text(input)
                    .map(str::to_string)
                    .unwrap_or_else(|| input.to_string());
                Ok(format!("tool: {}, input: {}", tool, shown))
            }
        }
    }
}

/// `input` itself when it is a string, else its `text` field
fn input_text(input: &Value) -> Option<&str> {
    match input {
        Value::String(s) => Some(s),
        other => other.get("text").and_then(Value::as_str),
    }
}

/// A registered agent: descriptor plus the backend that runs its tools
#[derive(Debug, Clone)]
pub struct Agent {
    descriptor: AgentDescriptor,
    backend: AgentBackend,
}

impl Agent {
    pub fn new(descriptor: AgentDescriptor, backend: AgentBackend) -> Self {
        Self {
            descriptor,
            backend,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    pub fn backend(&self) -> &AgentBackend {
        &self.backend
    }

    /// Run `tool` on `input`.
    ///
    /// Tools the descriptor does not declare fail with
    /// [`InvokeError::UnsupportedTool`] before the backend is touched.
    pub async fn invoke(&self, input: &Value, tool: &str) -> Result<String, InvokeError> {
        if !self.descriptor.supports(tool) {
            warn!("Agent '{}' does not declare tool '{}'", self.descriptor.id, tool);
            return Err(InvokeError::UnsupportedTool {
                agent: self.descriptor.id.clone(),
                tool: tool.to_string(),
            });
        }

        debug!(
            "Agent '{}' invoking '{}' via {} backend",
            self.descriptor.id,
            tool,
            self.backend.kind()
        );
        self.backend.call(&self.descriptor.id, input, tool).await
    }
}
