//! ---
//! ams_section: "04-agent-protocols"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Protocol contract and value processing for agents."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
//! Loopback protocol used for commissioning and tests.
//!
//! Actuator writes are echoed back as sensor updates after outbound processing.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use r_ams_model::agent::MockConfig;
use r_ams_model::asset::THING_ASSET_TYPE;
use r_ams_model::{
    Agent, AgentKind, Asset, AssetTreeNode, Attribute, AttributeEvent, AttributeRef,
    ConnectionStatus, Value,
};
use tracing::{debug, info};

use crate::protocol::{
    AgentDiscoveryCallback, DiscoveryCallback, InstanceDiscovery, Protocol,
    ProtocolAssetService, ProtocolCapabilities, ProtocolCore, Result,
};

/// Link property required on every link when the agent's `requiredTest` flag is set.
pub const REQUIRED_VALUE: &str = "requiredValue";

pub struct MockProtocol {
    core: ProtocolCore,
    config: MockConfig,
    writes: Mutex<Vec<(AttributeRef, Value)>>,
}

impl MockProtocol {
    pub const NAME: &'static str = "mock";

    pub fn new(agent_id: impl Into<String>, config: MockConfig) -> Self {
        Self {
            core: ProtocolCore::new(Self::NAME, agent_id),
            config,
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Values handed to the device so far, after outbound processing.
    pub fn received_writes(&self) -> Vec<(AttributeRef, Value)> {
        self.writes.lock().clone()
    }

    /// Simulate a device reporting `value` for a linked attribute.
    pub fn update_sensor(&self, reference: &AttributeRef, value: Value) -> bool {
        self.core.update_linked_attribute(reference, value)
    }

    /// Simulate a raw text message arriving from the device.
    pub fn inject_message(&self, message: &str) -> usize {
        self.core.dispatch_message(message)
    }
}

#[async_trait]
impl Protocol for MockProtocol {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn agent_id(&self) -> &str {
        self.core.agent_id()
    }

    fn capabilities(&self) -> ProtocolCapabilities {
        ProtocolCapabilities {
            asset_discovery: true,
            asset_import: false,
        }
    }

    fn start(&self, context: Arc<dyn ProtocolAssetService>) -> Result<()> {
        self.core.attach(context);
        info!(agent_id = %self.core.agent_id(), "mock protocol started");
        self.core.publish_status(ConnectionStatus::Connected);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.core.publish_status(ConnectionStatus::Disconnected);
        self.core.clear();
        self.core.detach();
        info!(agent_id = %self.core.agent_id(), "mock protocol stopped");
        Ok(())
    }

    fn link_attribute(&self, asset_id: &str, attribute: &Attribute) -> Result<()> {
        let entry = self.core.link(asset_id, attribute)?;
        if self.config.required_test {
            if let Err(err) = entry.link.require(REQUIRED_VALUE) {
                self.core.unlink(asset_id, attribute);
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn unlink_attribute(&self, asset_id: &str, attribute: &Attribute) -> Result<()> {
        self.core.unlink(asset_id, attribute);
        Ok(())
    }

    fn linked_attributes(&self) -> Vec<(AttributeRef, Attribute)> {
        self.core.linked_attributes()
    }

    fn is_linked(&self, reference: &AttributeRef) -> bool {
        self.core.is_linked(reference)
    }

    async fn process_linked_attribute_write(&self, event: AttributeEvent) -> Result<()> {
        let Some(value) = self.core.outbound_value(&event)? else {
            return Ok(());
        };
        debug!(attribute = %event.reference(), value = %value, "mock device received write");
        self.writes
            .lock()
            .push((event.reference().clone(), value.clone()));
        self.core.update_linked_attribute(event.reference(), value);
        Ok(())
    }

    async fn start_asset_discovery(&self, callback: DiscoveryCallback) -> anyhow::Result<()> {
        for device in &self.config.devices {
            let asset = Asset::new(device.clone(), THING_ASSET_TYPE).with_parent(self.core.agent_id());
            callback(vec![AssetTreeNode::new(asset)]);
            tokio::task::yield_now().await;
        }
        debug!(agent_id = %self.core.agent_id(), devices = self.config.devices.len(), "mock discovery finished");
        Ok(())
    }
}

/// Reports one mock agent per configured name.
#[derive(Debug, Clone, Default)]
pub struct MockInstanceDiscovery {
    names: Vec<String>,
}

impl MockInstanceDiscovery {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl InstanceDiscovery for MockInstanceDiscovery {
    fn name(&self) -> &'static str {
        MockProtocol::NAME
    }

    async fn discover(
        &self,
        parent_id: Option<String>,
        callback: AgentDiscoveryCallback,
    ) -> anyhow::Result<()> {
        let agents = self
            .names
            .iter()
            .map(|name| {
                let agent = Agent::new(AgentKind::MockAgent, name.clone());
                match &parent_id {
                    Some(parent) => {
                        let asset = agent.into_asset().with_parent(parent.clone());
                        Agent::from_asset(asset)
                    }
                    None => Ok(agent),
                }
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        callback(agents);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChildAssetConsumer, SubscriptionId};
    use r_ams_common::{Clock, FixedClock};
    use r_ams_model::{AgentLink, AssetQuery, ModelError, ValueType};
    use serde_json::json;

    #[derive(Default)]
    struct RecordingContext {
        events: Mutex<Vec<AttributeEvent>>,
        clock: FixedClock,
    }

    impl ProtocolAssetService for RecordingContext {
        fn send_attribute_event(&self, event: AttributeEvent) {
            self.events.lock().push(event);
        }
        fn merge_asset(&self, _agent_id: &str, asset: Asset) -> anyhow::Result<Asset> {
            Ok(asset)
        }
        fn delete_assets(&self, _agent_id: &str, _ids: &[String]) -> anyhow::Result<bool> {
            Ok(true)
        }
        fn find_asset(&self, _agent_id: &str, _asset_id: &str) -> Option<Asset> {
            None
        }
        fn find_assets(&self, _agent_id: &str, _query: AssetQuery) -> Vec<Asset> {
            Vec::new()
        }
        fn subscribe_child_asset_change(
            &self,
            _agent_id: &str,
            _consumer: ChildAssetConsumer,
        ) -> SubscriptionId {
            SubscriptionId(0)
        }
        fn unsubscribe_child_asset_change(&self, _agent_id: &str, _subscription: SubscriptionId) {}
        fn clock(&self) -> &dyn Clock {
            &self.clock
        }
    }

    fn linked(link: AgentLink) -> Attribute {
        Attribute::new("level", ValueType::Integer).with_agent_link(&link)
    }

    #[tokio::test]
    async fn echoes_writes_as_sensor_updates() {
        let context = Arc::new(RecordingContext::default());
        let protocol = MockProtocol::new("agent-1", MockConfig::default());
        protocol.start(context.clone()).unwrap();
        protocol
            .link_attribute("asset-1", &linked(AgentLink::new("agent-1")))
            .unwrap();

        let reference = AttributeRef::new("asset-1", "level");
        protocol
            .process_linked_attribute_write(AttributeEvent::new(reference.clone(), json!(7)))
            .await
            .unwrap();

        assert_eq!(protocol.received_writes(), vec![(reference.clone(), json!(7))]);
        let events = context.events.lock();
        assert_eq!(events.last().map(|e| e.value().clone()), Some(json!(7)));
        assert_eq!(events.last().map(|e| e.reference().clone()), Some(reference));
    }

    #[test]
    fn required_value_is_enforced() {
        let protocol = MockProtocol::new("agent-1", MockConfig { required_test: true, ..MockConfig::default() });
        let err = protocol
            .link_attribute("asset-1", &linked(AgentLink::new("agent-1")))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::ProtocolError::Model(ModelError::MissingAgentLinkProperty { .. })
        ));
        assert!(!protocol.is_linked(&AttributeRef::new("asset-1", "level")));

        let with_value = AgentLink::new("agent-1").with_property(REQUIRED_VALUE, json!("x"));
        protocol
            .link_attribute("asset-1", &linked(with_value))
            .unwrap();
        assert!(protocol.is_linked(&AttributeRef::new("asset-1", "level")));
    }

    #[test]
    fn foreign_links_are_rejected() {
        let protocol = MockProtocol::new("agent-1", MockConfig::default());
        assert!(protocol
            .link_attribute("asset-1", &linked(AgentLink::new("agent-2")))
            .is_err());
    }

    #[tokio::test]
    async fn discovery_announces_each_device() {
        let protocol = MockProtocol::new(
            "agent-1",
            MockConfig {
                required_test: false,
                devices: vec!["pump".into(), "valve".into()],
            },
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        protocol
            .start_asset_discovery(Arc::new(move |nodes: Vec<AssetTreeNode>| {
                sink.lock().extend(nodes.into_iter().map(|n| n.asset.name));
            }))
            .await
            .unwrap();
        assert_eq!(*seen.lock(), vec!["pump".to_owned(), "valve".to_owned()]);
    }

    #[tokio::test]
    async fn instance_discovery_parents_agents() {
        let found = Arc::new(Mutex::new(Vec::new()));
        let sink = found.clone();
        MockInstanceDiscovery::new(["a", "b"])
            .discover(
                Some("site".to_owned()),
                Arc::new(move |agents: Vec<Agent>| sink.lock().extend(agents)),
            )
            .await
            .unwrap();
        let found = found.lock();
        assert_eq!(found.len(), 2);
        assert!(found
            .iter()
            .all(|agent| agent.asset().parent_id.as_deref() == Some("site")
                && agent.kind() == AgentKind::MockAgent));
    }
}
