//! ---
//! ams_section: "04-agent-protocols"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Protocol contract and value processing for agents."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
use std::sync::Arc;

use r_ams_model::{Agent, AgentConfig};

use crate::protocol::{Protocol, Result};
use crate::protocols::{MockProtocol, ModbusProtocol};

/// Builds the protocol instance for an agent.
pub trait ProtocolFactory: Send + Sync {
    fn create(&self, agent: &Agent) -> Result<Arc<dyn Protocol>>;
}

/// Maps each [`r_ams_model::AgentKind`] to its built-in protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProtocolFactory;

impl ProtocolFactory for DefaultProtocolFactory {
    fn create(&self, agent: &Agent) -> Result<Arc<dyn Protocol>> {
        let protocol: Arc<dyn Protocol> = match agent.config()? {
            AgentConfig::Mock(config) => Arc::new(MockProtocol::new(agent.id(), config)),
            AgentConfig::Modbus(config) => Arc::new(ModbusProtocol::new(agent.id(), config)),
        };
        Ok(protocol)
    }
}
