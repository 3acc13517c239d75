//! ---
//! ams_section: "04-agent-protocols"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Protocol contract and value processing for agents."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
//! Built-in protocol implementations.

pub mod mock;
pub mod modbus;

pub use mock::{MockInstanceDiscovery, MockProtocol};
pub use modbus::{ModbusProtocol, RegisterBank};
