//! ---
//! ams_section: "04-agent-protocols"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Protocol contract and value processing for agents."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use r_ams_common::Clock;
use r_ams_model::agent::AGENT_STATUS;
use r_ams_model::{
    Agent, AgentLink, Asset, AssetQuery, AssetTreeNode, Attribute, AttributeEvent, AttributeRef,
    ConnectionStatus, ModelError, PersistenceEvent, Value,
};
use thiserror::Error;
use tracing::{debug, trace};

use crate::pipeline::{self, MessageMatcher};

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("{protocol} protocol for agent {agent_id} is not running")]
    NotRunning {
        protocol: &'static str,
        agent_id: String,
    },
    #[error("attribute {0} is not linked")]
    NotLinked(AttributeRef),
    #[error("attribute {reference} links to agent {linked} instead of {agent_id}")]
    ForeignLink {
        reference: AttributeRef,
        linked: String,
        agent_id: String,
    },
    #[error("invalid link for {reference}: {reason}")]
    InvalidLink {
        reference: AttributeRef,
        reason: String,
    },
    #[error("{operation} is not supported by the {protocol} protocol")]
    Unsupported {
        protocol: &'static str,
        operation: &'static str,
    },
    #[error("failed to start {protocol} protocol: {reason}")]
    Start {
        protocol: &'static str,
        reason: String,
    },
    #[error("write to {reference} failed: {reason}")]
    Write {
        reference: AttributeRef,
        reason: String,
    },
}

/// Optional operations a protocol instance supports, declared at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolCapabilities {
    pub asset_discovery: bool,
    pub asset_import: bool,
}

/// Receives batches of discovered assets; may be called many times per task.
pub type DiscoveryCallback = Arc<dyn Fn(Vec<AssetTreeNode>) + Send + Sync>;

/// Invoked with change events for assets beneath a protocol's agent.
pub type ChildAssetConsumer = Arc<dyn Fn(&PersistenceEvent) + Send + Sync>;

/// Receives batches of agents found by an [`InstanceDiscovery`] provider.
pub type AgentDiscoveryCallback = Arc<dyn Fn(Vec<Agent>) + Send + Sync>;

/// Finds protocol instances (agents) that could be created, such as devices answering
/// on a bus.
#[async_trait]
pub trait InstanceDiscovery: Send + Sync {
    fn name(&self) -> &'static str;

    async fn discover(
        &self,
        parent_id: Option<String>,
        callback: AgentDiscoveryCallback,
    ) -> anyhow::Result<()>;
}

/// Token returned by [`ProtocolAssetService::subscribe_child_asset_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Services offered to protocol instances by the linking service.
///
/// Provisioning calls are scoped to `agent_id`: new assets may only be parented under
/// that agent.
pub trait ProtocolAssetService: Send + Sync {
    /// Publish a sensor update for a linked attribute.
    fn send_attribute_event(&self, event: AttributeEvent);

    fn merge_asset(&self, agent_id: &str, asset: Asset) -> anyhow::Result<Asset>;

    fn delete_assets(&self, agent_id: &str, asset_ids: &[String]) -> anyhow::Result<bool>;

    fn find_asset(&self, agent_id: &str, asset_id: &str) -> Option<Asset>;

    /// Assets beneath the agent that also satisfy `query`.
    fn find_assets(&self, agent_id: &str, query: AssetQuery) -> Vec<Asset>;

    fn subscribe_child_asset_change(
        &self,
        agent_id: &str,
        consumer: ChildAssetConsumer,
    ) -> SubscriptionId;

    fn unsubscribe_child_asset_change(&self, agent_id: &str, subscription: SubscriptionId);

    fn clock(&self) -> &dyn Clock;
}

/// Runtime object performing I/O for one agent.
///
/// Methods take `&self`; implementations keep their mutable state behind locks so an
/// instance can be shared between the linking service and the actuator dispatcher.
#[async_trait]
pub trait Protocol: Send + Sync {
    fn name(&self) -> &'static str;

    fn agent_id(&self) -> &str;

    fn capabilities(&self) -> ProtocolCapabilities {
        ProtocolCapabilities::default()
    }

    fn start(&self, context: Arc<dyn ProtocolAssetService>) -> Result<()>;

    fn stop(&self) -> Result<()>;

    fn link_attribute(&self, asset_id: &str, attribute: &Attribute) -> Result<()>;

    fn unlink_attribute(&self, asset_id: &str, attribute: &Attribute) -> Result<()>;

    fn linked_attributes(&self) -> Vec<(AttributeRef, Attribute)>;

    fn is_linked(&self, reference: &AttributeRef) -> bool;

    /// Handle an actuator write addressed to a linked attribute.
    async fn process_linked_attribute_write(&self, event: AttributeEvent) -> Result<()>;

    async fn start_asset_discovery(&self, _callback: DiscoveryCallback) -> anyhow::Result<()> {
        Err(ProtocolError::Unsupported {
            protocol: self.name(),
            operation: "asset discovery",
        }
        .into())
    }

    async fn start_asset_import(
        &self,
        _data: Vec<u8>,
        _callback: DiscoveryCallback,
    ) -> anyhow::Result<()> {
        Err(ProtocolError::Unsupported {
            protocol: self.name(),
            operation: "asset import",
        }
        .into())
    }
}

/// Bookkeeping entry for one linked attribute.
#[derive(Debug, Clone)]
pub struct LinkedAttribute {
    pub attribute: Attribute,
    pub link: AgentLink,
    /// Whether the link's write value template contains the dynamic placeholder.
    pub dynamic_write: bool,
}

/// Linked attribute set and service context shared by every protocol implementation.
pub struct ProtocolCore {
    protocol: &'static str,
    agent_id: String,
    linked: RwLock<IndexMap<AttributeRef, LinkedAttribute>>,
    context: RwLock<Option<Arc<dyn ProtocolAssetService>>>,
}

impl fmt::Debug for ProtocolCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolCore")
            .field("protocol", &self.protocol)
            .field("agent_id", &self.agent_id)
            .field("linked", &self.linked.read().len())
            .finish()
    }
}

impl ProtocolCore {
    pub fn new(protocol: &'static str, agent_id: impl Into<String>) -> Self {
        Self {
            protocol,
            agent_id: agent_id.into(),
            linked: RwLock::new(IndexMap::new()),
            context: RwLock::new(None),
        }
    }

    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn attach(&self, context: Arc<dyn ProtocolAssetService>) {
        *self.context.write() = Some(context);
    }

    pub fn detach(&self) -> Option<Arc<dyn ProtocolAssetService>> {
        self.context.write().take()
    }

    pub fn context(&self) -> Result<Arc<dyn ProtocolAssetService>> {
        self.context
            .read()
            .clone()
            .ok_or_else(|| ProtocolError::NotRunning {
                protocol: self.protocol,
                agent_id: self.agent_id.clone(),
            })
    }

    /// Validate the attribute's agent link and record it as linked.
    pub fn link(&self, asset_id: &str, attribute: &Attribute) -> Result<LinkedAttribute> {
        let reference = AttributeRef::new(asset_id, attribute.name());
        let link = match attribute.agent_link() {
            Some(link) => link?,
            None => {
                return Err(ProtocolError::InvalidLink {
                    reference,
                    reason: "attribute has no agent link".to_owned(),
                })
            }
        };
        if link.id != self.agent_id {
            return Err(ProtocolError::ForeignLink {
                reference,
                linked: link.id,
                agent_id: self.agent_id.clone(),
            });
        }
        let entry = LinkedAttribute {
            dynamic_write: link.has_dynamic_write_value(),
            attribute: attribute.clone(),
            link,
        };
        debug!(protocol = self.protocol, agent_id = %self.agent_id, attribute = %reference, "attribute linked");
        self.linked.write().insert(reference, entry.clone());
        Ok(entry)
    }

    pub fn unlink(&self, asset_id: &str, attribute: &Attribute) -> Option<LinkedAttribute> {
        let reference = AttributeRef::new(asset_id, attribute.name());
        let removed = self.linked.write().shift_remove(&reference);
        if removed.is_some() {
            debug!(protocol = self.protocol, agent_id = %self.agent_id, attribute = %reference, "attribute unlinked");
        }
        removed
    }

    pub fn linked(&self, reference: &AttributeRef) -> Option<LinkedAttribute> {
        self.linked.read().get(reference).cloned()
    }

    pub fn linked_attributes(&self) -> Vec<(AttributeRef, Attribute)> {
        self.linked
            .read()
            .iter()
            .map(|(reference, entry)| (reference.clone(), entry.attribute.clone()))
            .collect()
    }

    pub fn is_linked(&self, reference: &AttributeRef) -> bool {
        self.linked.read().contains_key(reference)
    }

    pub fn linked_count(&self) -> usize {
        self.linked.read().len()
    }

    pub fn clear(&self) {
        self.linked.write().clear();
    }

    /// Run `value` through the inbound pipeline and publish the result as a sensor update.
    ///
    /// Returns `false` when the attribute is not linked, the protocol is not running, or
    /// the pipeline dropped the value.
    pub fn update_linked_attribute(&self, reference: &AttributeRef, value: Value) -> bool {
        let Some(entry) = self.linked(reference) else {
            trace!(attribute = %reference, "ignoring update for unlinked attribute");
            return false;
        };
        let Ok(context) = self.context() else {
            return false;
        };
        let outcome =
            pipeline::process_inbound(&reference.asset_id, &entry.attribute, &entry.link, value);
        if outcome.ignore {
            trace!(attribute = %reference, "inbound value ignored");
            return false;
        }
        context.send_attribute_event(AttributeEvent::at(
            reference.clone(),
            outcome.value,
            context.clock().now_millis(),
        ));
        true
    }

    /// Outbound pipeline for an actuator write; `None` when the value is to be dropped.
    pub fn outbound_value(&self, event: &AttributeEvent) -> Result<Option<Value>> {
        let entry = self
            .linked(event.reference())
            .ok_or_else(|| ProtocolError::NotLinked(event.reference().clone()))?;
        let outcome = pipeline::process_outbound(
            event.asset_id(),
            &entry.attribute,
            &entry.link,
            event.value().clone(),
            entry.dynamic_write,
        );
        if outcome.ignore {
            trace!(attribute = %event.reference(), "outbound value ignored");
            return Ok(None);
        }
        Ok(Some(outcome.value))
    }

    /// Feed a raw text message to every linked attribute with a message predicate.
    pub fn dispatch_message(&self, message: &str) -> usize {
        let Ok(context) = self.context() else {
            return 0;
        };
        let matchers: Vec<MessageMatcher> = self
            .linked
            .read()
            .iter()
            .filter_map(|(reference, entry)| MessageMatcher::for_link(reference.clone(), &entry.link))
            .collect();
        let mut delivered = 0;
        for matcher in matchers {
            if let Some(state) = matcher.handle(message, context.clock()) {
                if self.update_linked_attribute(&state.reference, state.value) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Publish the agent's connection status.
    pub fn publish_status(&self, status: ConnectionStatus) {
        if let Ok(context) = self.context() {
            debug!(protocol = self.protocol, agent_id = %self.agent_id, %status, "connection status changed");
            context.send_attribute_event(AttributeEvent::at(
                AttributeRef::new(self.agent_id.clone(), AGENT_STATUS),
                Value::String(status.to_string()),
                context.clock().now_millis(),
            ));
        }
    }
}
