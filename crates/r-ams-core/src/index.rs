//! ---
//! ams_section: "05-linking-core"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Agent linking and update routing."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use r_ams_agent::Protocol;
use r_ams_model::Agent;

/// Known agents and their running protocol instances.
///
/// Every protocol entry has a matching agent entry; the reverse does not hold for
/// disabled or failed agents.
#[derive(Default)]
pub(crate) struct LinkIndex {
    agents: HashMap<String, Agent>,
    protocols: HashMap<String, Arc<dyn Protocol>>,
}

impl LinkIndex {
    pub(crate) fn agent(&self, agent_id: &str) -> Option<&Agent> {
        self.agents.get(agent_id)
    }

    pub(crate) fn agents(&self) -> Vec<Agent> {
        self.agents.values().cloned().collect()
    }

    pub(crate) fn insert_agent(&mut self, agent: Agent) -> Option<Agent> {
        self.agents.insert(agent.id().to_owned(), agent)
    }

    pub(crate) fn remove_agent(&mut self, agent_id: &str) -> Option<Agent> {
        self.agents.remove(agent_id)
    }

    pub(crate) fn protocol(&self, agent_id: &str) -> Option<Arc<dyn Protocol>> {
        self.protocols.get(agent_id).cloned()
    }

    pub(crate) fn insert_protocol(&mut self, agent_id: &str, protocol: Arc<dyn Protocol>) {
        self.protocols.insert(agent_id.to_owned(), protocol);
    }

    pub(crate) fn remove_protocol(&mut self, agent_id: &str) -> Option<Arc<dyn Protocol>> {
        self.protocols.remove(agent_id)
    }

    pub(crate) fn running(&self) -> usize {
        self.protocols.len()
    }

    pub(crate) fn running_ids(&self) -> Vec<String> {
        self.protocols.keys().cloned().collect()
    }

    /// First of `ancestors` that is a known agent.
    pub(crate) fn owning_agent<'a>(
        &self,
        mut ancestors: impl Iterator<Item = &'a str>,
    ) -> Option<String> {
        ancestors
            .find(|id| self.agents.contains_key(*id))
            .map(str::to_owned)
    }
}
