//! Agent descriptor: identity and declared capabilities

use serde::{Deserialize, Serialize};

use crate::types::{PresenceRecord, STATUS_AVAILABLE};

/// Identity of an agent and the tools it declares
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            tools: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Declare tools; duplicates collapse since the set is unordered
    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tool in tools {
            let tool = tool.into();
            if !self.tools.contains(&tool) {
                self.tools.push(tool);
            }
        }
        self
    }

    /// Whether `tool` is one of the declared capabilities
    pub fn supports(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t == tool)
    }

    /// The presence entry announced for this agent
    pub fn presence_record(&self) -> PresenceRecord {
        PresenceRecord {
            agent_id: self.id.clone(),
            tools: self.tools.clone(),
            status: STATUS_AVAILABLE.to_string(),
        }
    }
}
