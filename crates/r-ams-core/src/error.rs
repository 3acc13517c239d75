//! ---
//! ams_section: "05-linking-core"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Agent linking and update routing."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
use r_ams_agent::ProtocolError;
use r_ams_model::{AttributeRef, ModelError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("asset {0} not found")]
    NotFound(String),
    #[error("parent {parent_id} of asset {asset_id} not found")]
    ParentNotFound { asset_id: String, parent_id: String },
    #[error("asset {asset_id} cannot be its own ancestor")]
    Cycle { asset_id: String },
    #[error("attribute {0} does not exist")]
    UnknownAttribute(AttributeRef),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0} channel closed")]
    Closed(&'static str),
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("agent {0} has no running protocol instance")]
    AgentNotRunning(String),
    #[error("{operation} is not supported by agent {agent_id}")]
    Unsupported {
        agent_id: String,
        operation: &'static str,
    },
    #[error("a discovery or import task is already running for agent {0}")]
    AlreadyRunning(String),
    #[error("parent {0} belongs to a gateway")]
    GatewayParent(String),
    #[error("no async runtime available to run discovery")]
    NoRuntime,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("asset {asset_id} is outside agent {agent_id}")]
    OutsideAgent { agent_id: String, asset_id: String },
}
