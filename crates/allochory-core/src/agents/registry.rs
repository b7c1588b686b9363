//! Agent registry: maps agent identifiers to agents

use std::collections::HashMap;
use tracing::{debug, info};

use super::backend::Agent;
use super::descriptor::AgentDescriptor;

/// Registry of agents keyed by id, listed in registration order.
///
/// Populated at startup and then shared read-only (typically behind an
/// `Arc`), so concurrent lookups need no locking.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: Vec<Agent>,
    index: HashMap<String, usize>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an agent, overwriting any agent with the same id.
    ///
    /// An overwritten agent keeps its listing position. Returns the replaced agent.
    pub fn register(&mut self, agent: Agent) -> Option<Agent> {
        let id = agent.id().to_string();
        info!(
            "AgentRegistry: registered '{}' ({}) with tools [{}]",
            id,
            agent.descriptor().name,
            agent.descriptor().tools.join(", ")
        );
        match self.index.get(&id) {
            Some(&slot) => {
                debug!("AgentRegistry: '{}' overwrites an existing entry", id);
                Some(std::mem::replace(&mut self.agents[slot], agent))
            }
            None => {
                self.index.insert(id, self.agents.len());
                self.agents.push(agent);
                None
            }
        }
    }

    /// Look up an agent by id
    pub fn find(&self, id: &str) -> Option<&Agent> {
        self.index.get(id).map(|&slot| &self.agents[slot])
    }

    /// Descriptors of every registered agent, in registration order
    pub fn list(&self) -> Vec<&AgentDescriptor> {
        self.agents.iter().map(Agent::descriptor).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
