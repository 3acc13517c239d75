//! ---
//! ams_section: "05-linking-core"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Agent linking and update routing."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
//! Agent linking service: keeps protocol instances in step with the asset store and
//! routes attribute writes between clients, storage and devices.

pub mod discovery;
mod error;
pub mod gateway;
mod index;
pub mod processing;
pub mod service;
pub mod store;
pub mod transport;

pub use discovery::{DiscoveryRunner, TaskHandle, TaskKind, TaskOutcome};
pub use error::{CoreError, DiscoveryError, Result, StoreError, TransportError};
pub use gateway::{GatewayRegistry, StaticGatewayRegistry};
pub use processing::{AssetProcessor, WriteOutcome};
pub use service::{AgentService, AgentServiceBuilder};
pub use store::{AssetStore, InMemoryAssetStore, PersistenceListener};
pub use transport::{ActuatorMessage, ActuatorQueue, BusReceivers, ChannelBus, MessageBus};
