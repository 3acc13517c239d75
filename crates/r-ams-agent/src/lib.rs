//! ---
//! ams_section: "04-agent-protocols"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Protocol contract and value processing for agents."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
//! Protocol contract, linked attribute bookkeeping and the value pipeline used on the
//! data path between protocol instances and linked attributes.

pub mod factory;
pub mod pipeline;
pub mod protocol;
pub mod protocols;

pub use factory::{DefaultProtocolFactory, ProtocolFactory};
pub use pipeline::{MessageMatcher, ValueOutcome};
pub use protocol::{
    AgentDiscoveryCallback, ChildAssetConsumer, DiscoveryCallback, InstanceDiscovery,
    LinkedAttribute, Protocol, ProtocolAssetService, ProtocolCapabilities, ProtocolCore,
    ProtocolError, Result, SubscriptionId,
};
