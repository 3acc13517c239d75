//! ---
//! ams_section: "02-asset-model"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Typed asset and attribute model."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
//! Asset, attribute and agent link model shared by protocols and the linking service.

pub mod agent;
pub mod agent_link;
pub mod asset;
pub mod attribute;
mod error;
pub mod event;
pub mod filter;
pub mod predicate;
pub mod query;
pub mod value;

pub use agent::{Agent, AgentConfig, AgentKind, ConnectionStatus, ExecutionStatus};
pub use agent_link::AgentLink;
pub use asset::{Asset, AssetTreeNode};
pub use attribute::{Attribute, AttributeList, MetaList};
pub use error::{ModelError, Result};
pub use event::{
    AttributeEvent, AttributeRef, AttributeState, PersistenceCause, PersistenceEvent, Source,
};
pub use filter::ValueFilter;
pub use predicate::{StringPredicate, ValuePredicate};
pub use query::{AssetQuery, MetaPredicate};
pub use value::{Value, ValueDescriptor, ValueType};
