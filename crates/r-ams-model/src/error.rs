//! ---
//! ams_section: "02-asset-model"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Typed asset and attribute model."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
use thiserror::Error;

use crate::value::ValueType;

pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("agent link to '{agent_id}' is missing required property '{property}'")]
    MissingAgentLinkProperty { agent_id: String, property: String },
    #[error("invalid agent link: {0}")]
    InvalidAgentLink(#[source] serde_json::Error),
    #[error("asset {asset_id} of type '{asset_type}' is not an agent")]
    NotAnAgent { asset_id: String, asset_type: String },
    #[error("agent {agent_id} has invalid configuration: {reason}")]
    InvalidAgentConfig { agent_id: String, reason: String },
    #[error("cannot coerce {value} to {expected}")]
    Coercion { expected: ValueType, value: String },
    #[error("asset {asset_id} has no attribute '{attribute}'")]
    UnknownAttribute { asset_id: String, attribute: String },
}
