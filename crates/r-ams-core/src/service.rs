//! ---
//! ams_section: "05-linking-core"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Agent linking and update routing."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
//! Agent lifecycle, attribute linking and update routing.
//!
//! [`AgentService`] keeps one protocol instance per enabled agent, links attributes whose
//! agent link references that agent, reacts to asset changes, forwards writes on linked
//! attributes to the actuator bus and offers provisioning services back to protocols.
//!
//! Lifecycle and linking operations are serialized by a re-entrant lock, so a protocol
//! that provisions assets from inside `start` re-enters the service on the same thread.
//! The index lock is only ever held for short lookups and never across protocol calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, ReentrantMutex};
use r_ams_agent::{
    AgentDiscoveryCallback, ChildAssetConsumer, DefaultProtocolFactory, DiscoveryCallback,
    InstanceDiscovery, Protocol, ProtocolAssetService, ProtocolFactory, SubscriptionId,
};
use r_ams_common::{Clock, LinkingConfig, SystemClock};
use r_ams_metrics::LinkingMetrics;
use r_ams_model::agent::AGENT_STATUS;
use r_ams_model::event::PROPERTY_ATTRIBUTES;
use r_ams_model::{
    Agent, AgentKind, Asset, AssetQuery, AssetTreeNode, Attribute, AttributeEvent, AttributeRef,
    ConnectionStatus, PersistenceCause, PersistenceEvent, Source, Value,
};
use strum::IntoEnumIterator;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::discovery::{DiscoveryRunner, TaskHandle, TaskKind};
use crate::error::{CoreError, DiscoveryError};
use crate::gateway::{GatewayRegistry, StaticGatewayRegistry};
use crate::index::LinkIndex;
use crate::store::{AssetStore, PersistenceListener};
use crate::transport::{ActuatorMessage, ActuatorQueue, MessageBus};

type Subscriptions = HashMap<String, Vec<(SubscriptionId, ChildAssetConsumer)>>;

pub struct AgentServiceBuilder {
    store: Arc<dyn AssetStore>,
    bus: Arc<dyn MessageBus>,
    factory: Arc<dyn ProtocolFactory>,
    gateways: Arc<dyn GatewayRegistry>,
    clock: Arc<dyn Clock>,
    metrics: Option<LinkingMetrics>,
    config: LinkingConfig,
}

impl AgentServiceBuilder {
    pub fn factory(mut self, factory: Arc<dyn ProtocolFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn gateways(mut self, gateways: Arc<dyn GatewayRegistry>) -> Self {
        self.gateways = gateways;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: LinkingMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(mut self, config: LinkingConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the service and subscribe it to the store's change feed.
    pub fn build(self) -> Arc<AgentService> {
        let discovery = DiscoveryRunner::new(self.config.discovery_timeout, self.metrics.clone());
        let service = Arc::new_cyclic(|me| AgentService {
            me: me.clone(),
            store: self.store,
            bus: self.bus,
            factory: self.factory,
            gateways: self.gateways,
            clock: self.clock,
            metrics: self.metrics,
            config: self.config,
            lifecycle: ReentrantMutex::new(()),
            index: Mutex::new(LinkIndex::default()),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            discovery,
        });
        let weak: Weak<AgentService> = Arc::downgrade(&service);
        let listener: Weak<dyn PersistenceListener> = weak;
        service.store.add_listener(listener);
        service
    }
}

pub struct AgentService {
    me: Weak<AgentService>,
    store: Arc<dyn AssetStore>,
    bus: Arc<dyn MessageBus>,
    factory: Arc<dyn ProtocolFactory>,
    gateways: Arc<dyn GatewayRegistry>,
    clock: Arc<dyn Clock>,
    metrics: Option<LinkingMetrics>,
    config: LinkingConfig,
    lifecycle: ReentrantMutex<()>,
    index: Mutex<LinkIndex>,
    subscriptions: Mutex<Subscriptions>,
    next_subscription: AtomicU64,
    discovery: DiscoveryRunner,
}

impl AgentService {
    pub fn builder(store: Arc<dyn AssetStore>, bus: Arc<dyn MessageBus>) -> AgentServiceBuilder {
        AgentServiceBuilder {
            store,
            bus,
            factory: Arc::new(DefaultProtocolFactory),
            gateways: Arc::new(StaticGatewayRegistry::default()),
            clock: Arc::new(SystemClock),
            metrics: None,
            config: LinkingConfig::default(),
        }
    }

    /// Load every agent from the store and start the enabled ones.
    pub fn start(&self) {
        let _lifecycle = self.lifecycle.lock();
        let kinds: Vec<String> = AgentKind::iter().map(|kind| kind.to_string()).collect();
        let mut loaded = 0usize;
        for asset in self.store.find_all(&AssetQuery::new().types(kinds)) {
            if self.gateways.is_gateway_owned(&asset) {
                debug!(agent_id = %asset.id, "skipping gateway agent");
                continue;
            }
            match Agent::from_asset(asset) {
                Ok(agent) => {
                    self.index.lock().insert_agent(agent.clone());
                    self.start_or_disable(&agent);
                    loaded += 1;
                }
                Err(err) => warn!(error = %err, "skipping malformed agent"),
            }
        }
        let running = self.index.lock().running();
        info!(agents = loaded, running, "agent service started");
    }

    /// Stop every running protocol instance, cancel background discovery and forget all
    /// agents.
    pub fn stop(&self) {
        let _lifecycle = self.lifecycle.lock();
        let running = self.index.lock().running_ids();
        for agent_id in running {
            self.stop_agent(&agent_id);
        }
        self.discovery.cancel_all();
        let mut index = self.index.lock();
        for agent in index.agents() {
            index.remove_agent(agent.id());
        }
        info!("agent service stopped");
    }

    pub fn agents(&self) -> Vec<Agent> {
        self.index.lock().agents()
    }

    pub fn agent(&self, agent_id: &str) -> Option<Agent> {
        self.index.lock().agent(agent_id).cloned()
    }

    pub fn protocol(&self, agent_id: &str) -> Option<Arc<dyn Protocol>> {
        self.index.lock().protocol(agent_id)
    }

    pub fn is_running(&self, agent_id: &str) -> bool {
        self.index.lock().protocol(agent_id).is_some()
    }

    pub fn is_discovery_running(&self, agent_id: &str) -> bool {
        self.discovery.is_busy(agent_id)
    }

    /// Create, register and start the protocol instance for `agent`, then link every
    /// attribute that references it.
    ///
    /// Failures are logged, published as an `ERROR` status and leave no instance
    /// registered. Returns whether the agent is running afterwards.
    pub fn start_agent(&self, agent: &Agent) -> bool {
        let _lifecycle = self.lifecycle.lock();
        let agent_id = agent.id();
        if self.is_running(agent_id) {
            debug!(agent_id, "agent already running");
            return true;
        }
        let Some(context) = self.me.upgrade() else {
            return false;
        };
        self.index.lock().insert_agent(agent.clone());

        let protocol = match self.factory.create(agent) {
            Ok(protocol) => protocol,
            Err(err) => {
                error!(agent_id, kind = %agent.kind(), error = %err, "failed to create protocol instance");
                self.record_start(agent, "failed");
                self.publish_agent_status(agent_id, ConnectionStatus::Error);
                return false;
            }
        };

        self.index.lock().insert_protocol(agent_id, protocol.clone());
        if let Err(err) = protocol.start(context) {
            error!(agent_id, protocol = protocol.name(), error = %err, "failed to start protocol instance");
            self.index.lock().remove_protocol(agent_id);
            self.record_start(agent, "failed");
            self.publish_agent_status(agent_id, ConnectionStatus::Error);
            return false;
        }
        info!(agent_id, protocol = protocol.name(), "protocol instance started");
        self.record_start(agent, "started");

        for asset in self.store.find_all(&AssetQuery::linked_to_agent(agent_id)) {
            if self.gateways.is_gateway_owned(&asset) {
                continue;
            }
            let groups = self.group_by_agent(&asset.id, asset.attributes.iter());
            if let Some(attributes) = groups.get(agent_id) {
                self.link_attributes(agent_id, &asset.id, attributes);
            }
        }
        true
    }

    /// Cancel any discovery task, unlink everything, stop the protocol instance and
    /// deregister it.
    pub fn stop_agent(&self, agent_id: &str) {
        let _lifecycle = self.lifecycle.lock();
        let Some(protocol) = self.protocol(agent_id) else {
            trace!(agent_id, "agent not running");
            return;
        };
        if self.discovery.cancel(agent_id) {
            info!(agent_id, "discovery task cancelled by agent stop");
        }

        let mut by_asset: IndexMap<String, Vec<Attribute>> = IndexMap::new();
        for (reference, attribute) in protocol.linked_attributes() {
            by_asset.entry(reference.asset_id).or_default().push(attribute);
        }
        for (asset_id, attributes) in &by_asset {
            self.unlink_attributes(agent_id, asset_id, attributes);
        }

        if let Err(err) = protocol.stop() {
            warn!(
                agent_id,
                protocol = protocol.name(),
                error = %err,
                "protocol instance failed to stop cleanly"
            );
        }
        self.subscriptions.lock().remove(agent_id);
        let running = {
            let mut index = self.index.lock();
            index.remove_protocol(agent_id);
            index.running()
        };
        if let Some(metrics) = &self.metrics {
            metrics.clear_agent(agent_id);
            metrics.set_running_agents(running);
        }
        info!(agent_id, protocol = protocol.name(), "protocol instance stopped");
    }

    /// Link `attributes` of `asset_id` to the running instance of `agent_id`.
    ///
    /// Already linked attributes are skipped. A failure on one attribute does not stop
    /// the others.
    pub fn link_attributes(&self, agent_id: &str, asset_id: &str, attributes: &[Attribute]) {
        let _lifecycle = self.lifecycle.lock();
        let Some(protocol) = self.protocol(agent_id) else {
            debug!(agent_id, asset_id, "agent not running; attributes left unlinked");
            return;
        };
        for attribute in attributes {
            let reference = AttributeRef::new(asset_id, attribute.name());
            if protocol.is_linked(&reference) {
                trace!(agent_id, attribute = %reference, "attribute already linked");
                continue;
            }
            match protocol.link_attribute(asset_id, attribute) {
                Ok(()) => debug!(agent_id, attribute = %reference, "attribute linked"),
                Err(err) => {
                    warn!(agent_id, attribute = %reference, error = %err, "failed to link attribute")
                }
            }
        }
        self.record_linked(agent_id, protocol.as_ref());
    }

    pub fn unlink_attributes(&self, agent_id: &str, asset_id: &str, attributes: &[Attribute]) {
        let _lifecycle = self.lifecycle.lock();
        let Some(protocol) = self.protocol(agent_id) else {
            trace!(agent_id, asset_id, "agent not running; nothing to unlink");
            return;
        };
        for attribute in attributes {
            let reference = AttributeRef::new(asset_id, attribute.name());
            if !protocol.is_linked(&reference) {
                continue;
            }
            match protocol.unlink_attribute(asset_id, attribute) {
                Ok(()) => debug!(agent_id, attribute = %reference, "attribute unlinked"),
                Err(err) => {
                    warn!(agent_id, attribute = %reference, error = %err, "failed to unlink attribute")
                }
            }
        }
        self.record_linked(agent_id, protocol.as_ref());
    }

    /// Route an attribute write through the agent layer.
    ///
    /// Returns `true` when the write was consumed here and must not be persisted by the
    /// caller: writes on linked attributes go to the actuator bus instead.
    pub fn process_asset_update(
        &self,
        asset: &Asset,
        event: &AttributeEvent,
        source: Source,
    ) -> bool {
        if matches!(source, Source::Sensor | Source::Gateway) {
            return false;
        }

        let cached = self.agent(&asset.id);
        if let Some(agent) = cached {
            self.update_agent_attribute(agent, event);
            return false;
        }

        let Some(attribute) = asset.attribute(event.name()) else {
            return false;
        };
        let link = match attribute.agent_link() {
            None => return false,
            Some(Ok(link)) => link,
            Some(Err(err)) => {
                warn!(attribute = %event.reference(), error = %err, "malformed agent link; persisting write");
                return false;
            }
        };
        debug!(agent_id = %link.id, attribute = %event.reference(), ?source, "forwarding write to agent");
        if let Err(err) = self.bus.send_actuator(&link.id, event.clone()) {
            error!(
                agent_id = %link.id,
                attribute = %event.reference(),
                error = %err,
                "failed to forward actuator write"
            );
        } else if let Some(metrics) = &self.metrics {
            metrics.record_actuator_write(&link.id);
        }
        true
    }

    /// Deliver actuator writes from `queue` to the owning protocol instances.
    pub fn spawn_actuator_dispatcher(self: &Arc<Self>, mut queue: ActuatorQueue) -> JoinHandle<()> {
        let service = Arc::downgrade(self);
        let warn_at = self.config.actuator_queue_warn;
        tokio::spawn(async move {
            let mut backlogged = false;
            while let Some(message) = queue.recv().await {
                let backlog = queue.depth();
                if backlog >= warn_at && !backlogged {
                    warn!(backlog, threshold = warn_at, "actuator queue is backing up");
                    backlogged = true;
                } else if backlog < warn_at / 2 {
                    backlogged = false;
                }
                let Some(service) = service.upgrade() else {
                    break;
                };
                service.dispatch_actuator(message).await;
            }
            debug!("actuator dispatcher stopped");
        })
    }

    async fn dispatch_actuator(&self, message: ActuatorMessage) {
        let ActuatorMessage { agent_id, event } = message;
        let Some(protocol) = self.protocol(&agent_id) else {
            warn!(agent_id, attribute = %event.reference(), "no running protocol for actuator write");
            return;
        };
        if !protocol.is_linked(event.reference()) {
            warn!(agent_id, attribute = %event.reference(), "actuator write for unlinked attribute");
            return;
        }
        let reference = event.reference().clone();
        if let Err(err) = protocol.process_linked_attribute_write(event).await {
            warn!(agent_id, attribute = %reference, error = %err, "protocol rejected actuator write");
        }
    }

    pub fn do_protocol_asset_discovery(
        &self,
        agent_id: &str,
        callback: DiscoveryCallback,
    ) -> Result<TaskHandle, DiscoveryError> {
        let protocol = self
            .protocol(agent_id)
            .ok_or_else(|| DiscoveryError::AgentNotRunning(agent_id.to_owned()))?;
        if !protocol.capabilities().asset_discovery {
            return Err(DiscoveryError::Unsupported {
                agent_id: agent_id.to_owned(),
                operation: "asset discovery",
            });
        }
        self.discovery
            .run_exclusive(agent_id, TaskKind::AssetDiscovery, async move {
                protocol.start_asset_discovery(callback).await
            })
    }

    pub fn do_protocol_asset_import(
        &self,
        agent_id: &str,
        data: Vec<u8>,
        callback: DiscoveryCallback,
    ) -> Result<TaskHandle, DiscoveryError> {
        let protocol = self
            .protocol(agent_id)
            .ok_or_else(|| DiscoveryError::AgentNotRunning(agent_id.to_owned()))?;
        if !protocol.capabilities().asset_import {
            return Err(DiscoveryError::Unsupported {
                agent_id: agent_id.to_owned(),
                operation: "asset import",
            });
        }
        self.discovery
            .run_exclusive(agent_id, TaskKind::AssetImport, async move {
                protocol.start_asset_import(data, callback).await
            })
    }

    /// Run an instance discovery provider in the background.
    ///
    /// Instance discovery does not take the per-agent slot. Parents mirrored from a
    /// gateway are refused.
    pub fn do_protocol_instance_discovery(
        &self,
        parent_id: Option<&str>,
        provider: Arc<dyn InstanceDiscovery>,
        callback: AgentDiscoveryCallback,
    ) -> Result<TaskHandle, DiscoveryError> {
        if let Some(parent) = parent_id.and_then(|id| self.store.find(id)) {
            if parent.is_gateway() || self.gateways.is_gateway_owned(&parent) {
                return Err(DiscoveryError::GatewayParent(parent.id));
            }
        }
        let target = parent_id.unwrap_or(provider.name()).to_owned();
        let parent = parent_id.map(str::to_owned);
        self.discovery
            .run_detached(&target, TaskKind::InstanceDiscovery, async move {
                provider.discover(parent, callback).await
            })
    }

    /// Merge discovered asset trees beneath `agent_id`, returning the number of assets
    /// written. Roots without a parent are attached to the agent.
    pub fn merge_discovered_assets(
        &self,
        agent_id: &str,
        nodes: Vec<AssetTreeNode>,
    ) -> Result<usize, CoreError> {
        let mut merged = 0;
        for node in nodes {
            merged += self.merge_tree(agent_id, agent_id, node)?;
        }
        Ok(merged)
    }

    fn merge_tree(
        &self,
        agent_id: &str,
        parent_id: &str,
        node: AssetTreeNode,
    ) -> Result<usize, CoreError> {
        let AssetTreeNode { mut asset, children } = node;
        if asset.parent_id.is_none() {
            asset.parent_id = Some(parent_id.to_owned());
        }
        self.ensure_under_agent(agent_id, &asset)?;
        let stored = self.store.merge(asset)?;
        let mut merged = 1;
        for child in children {
            merged += self.merge_tree(agent_id, &stored.id, child)?;
        }
        Ok(merged)
    }

    fn ensure_under_agent(&self, agent_id: &str, asset: &Asset) -> Result<(), CoreError> {
        let outside = || CoreError::OutsideAgent {
            agent_id: agent_id.to_owned(),
            asset_id: asset.id.clone(),
        };
        if asset.id == agent_id {
            return Err(outside());
        }
        if let Some(existing) = self.store.find(&asset.id) {
            if !existing.ancestors().any(|id| id == agent_id) {
                return Err(outside());
            }
        }
        let parent_id = asset.parent_id.as_deref().ok_or_else(outside)?;
        if parent_id == agent_id {
            return Ok(());
        }
        let parent = self.store.find(parent_id).ok_or_else(outside)?;
        if parent.ancestors().any(|id| id == agent_id) {
            Ok(())
        } else {
            Err(outside())
        }
    }

    fn start_or_disable(&self, agent: &Agent) {
        if agent.is_disabled() {
            info!(agent_id = %agent.id(), "agent is disabled");
            self.publish_agent_status(agent.id(), ConnectionStatus::Disabled);
        } else {
            self.start_agent(agent);
        }
    }

    fn update_agent_attribute(&self, mut agent: Agent, event: &AttributeEvent) {
        let _lifecycle = self.lifecycle.lock();
        let Some(mut attribute) = agent.asset().attribute(event.name()).cloned() else {
            return;
        };
        let was_disabled = agent.is_disabled();
        attribute.set_value_at(event.value().clone(), event.timestamp);
        agent.add_or_replace_attribute(attribute);
        self.index.lock().insert_agent(agent.clone());

        if was_disabled != agent.is_disabled() {
            info!(agent_id = %agent.id(), disabled = agent.is_disabled(), "agent disabled flag changed");
            self.stop_agent(agent.id());
            self.start_or_disable(&agent);
        }
    }

    fn on_agent_persistence(&self, event: &PersistenceEvent) {
        let _lifecycle = self.lifecycle.lock();
        let agent_id = event.entity.id.as_str();
        match event.cause {
            PersistenceCause::Create | PersistenceCause::Update => {
                let agent = match Agent::from_asset(event.entity.clone()) {
                    Ok(agent) => agent,
                    Err(err) => {
                        warn!(agent_id, error = %err, "ignoring malformed agent");
                        return;
                    }
                };
                if event.cause == PersistenceCause::Update {
                    self.index.lock().remove_agent(agent_id);
                    self.stop_agent(agent_id);
                }
                info!(agent_id, cause = ?event.cause, "agent changed");
                self.index.lock().insert_agent(agent.clone());
                self.start_or_disable(&agent);
            }
            PersistenceCause::Delete => {
                if self.index.lock().remove_agent(agent_id).is_none() {
                    return;
                }
                info!(agent_id, "agent deleted");
                self.stop_agent(agent_id);
            }
        }
    }

    fn on_asset_persistence(&self, event: &PersistenceEvent) {
        let asset = &event.entity;
        match event.cause {
            PersistenceCause::Create => {
                let linked = self.group_by_agent(&asset.id, asset.attributes.iter());
                for (agent_id, attributes) in linked {
                    self.link_attributes(&agent_id, &asset.id, &attributes);
                }
            }
            PersistenceCause::Update => {
                if !event.touched(PROPERTY_ATTRIBUTES) {
                    return;
                }
                let Some(previous) = &event.previous else {
                    return;
                };
                let removed = self.group_by_agent(
                    &asset.id,
                    previous.attributes.added_or_modified(&asset.attributes),
                );
                for (agent_id, attributes) in removed {
                    self.unlink_attributes(&agent_id, &asset.id, &attributes);
                }
                let added = self.group_by_agent(
                    &asset.id,
                    asset.attributes.added_or_modified(&previous.attributes),
                );
                for (agent_id, attributes) in added {
                    self.link_attributes(&agent_id, &asset.id, &attributes);
                }
            }
            PersistenceCause::Delete => {
                let linked = self.group_by_agent(&asset.id, asset.attributes.iter());
                for (agent_id, attributes) in linked {
                    self.unlink_attributes(&agent_id, &asset.id, &attributes);
                }
            }
        }
    }

    fn group_by_agent<'a>(
        &self,
        asset_id: &str,
        attributes: impl Iterator<Item = &'a Attribute>,
    ) -> IndexMap<String, Vec<Attribute>> {
        let mut groups: IndexMap<String, Vec<Attribute>> = IndexMap::new();
        for attribute in attributes {
            match attribute.agent_link() {
                None => {}
                Some(Ok(link)) => groups.entry(link.id).or_default().push(attribute.clone()),
                Some(Err(err)) => {
                    warn!(asset_id, attribute = attribute.name(), error = %err, "ignoring malformed agent link")
                }
            }
        }
        groups
    }

    fn notify_child_asset_change(&self, event: &PersistenceEvent) {
        let owner = self.index.lock().owning_agent(event.entity.ancestors());
        let Some(agent_id) = owner else {
            return;
        };
        let consumers: Vec<ChildAssetConsumer> = self
            .subscriptions
            .lock()
            .get(&agent_id)
            .map(|subscribers| subscribers.iter().map(|(_, consumer)| consumer.clone()).collect())
            .unwrap_or_default();
        for consumer in consumers {
            consumer(event);
        }
    }

    fn publish_agent_status(&self, agent_id: &str, status: ConnectionStatus) {
        let event = AttributeEvent::at(
            AttributeRef::new(agent_id, AGENT_STATUS),
            Value::String(status.to_string()),
            self.clock.now_millis(),
        );
        if let Err(err) = self.bus.send_sensor(event) {
            warn!(agent_id, %status, error = %err, "failed to publish agent status");
        }
    }

    fn record_start(&self, agent: &Agent, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_start(agent.kind().as_ref(), outcome);
            metrics.set_running_agents(self.index.lock().running());
        }
    }

    fn record_linked(&self, agent_id: &str, protocol: &dyn Protocol) {
        if let Some(metrics) = &self.metrics {
            metrics.set_linked_attributes(agent_id, protocol.linked_attributes().len());
        }
    }
}

impl PersistenceListener for AgentService {
    fn on_persistence_event(&self, event: &PersistenceEvent) {
        if self.gateways.is_gateway_owned(&event.entity) {
            trace!(asset_id = %event.entity.id, "ignoring gateway asset change");
            return;
        }
        if event.entity.is_agent() {
            self.on_agent_persistence(event);
        } else {
            self.on_asset_persistence(event);
        }
        self.notify_child_asset_change(event);
    }
}

impl ProtocolAssetService for AgentService {
    fn send_attribute_event(&self, event: AttributeEvent) {
        if let Err(err) = self.bus.send_sensor(event) {
            warn!(error = %err, "failed to publish sensor update");
        }
    }

    fn merge_asset(&self, agent_id: &str, asset: Asset) -> anyhow::Result<Asset> {
        self.ensure_under_agent(agent_id, &asset)?;
        Ok(self.store.merge(asset)?)
    }

    fn delete_assets(&self, agent_id: &str, asset_ids: &[String]) -> anyhow::Result<bool> {
        for asset_id in asset_ids {
            if let Some(asset) = self.store.find(asset_id) {
                if !asset.ancestors().any(|id| id == agent_id) {
                    return Err(CoreError::OutsideAgent {
                        agent_id: agent_id.to_owned(),
                        asset_id: asset_id.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(self.store.delete(asset_ids)?)
    }

    fn find_asset(&self, agent_id: &str, asset_id: &str) -> Option<Asset> {
        self.store
            .find(asset_id)
            .filter(|asset| asset.ancestors().any(|id| id == agent_id))
    }

    fn find_assets(&self, agent_id: &str, query: AssetQuery) -> Vec<Asset> {
        self.store
            .find_all(&query.under(agent_id))
            .into_iter()
            .filter(|asset| asset.id != agent_id)
            .collect()
    }

    fn subscribe_child_asset_change(
        &self,
        agent_id: &str,
        consumer: ChildAssetConsumer,
    ) -> SubscriptionId {
        let subscription = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .lock()
            .entry(agent_id.to_owned())
            .or_default()
            .push((subscription, consumer));
        debug!(agent_id, %subscription, "child asset subscription added");
        subscription
    }

    fn unsubscribe_child_asset_change(&self, agent_id: &str, subscription: SubscriptionId) {
        let mut subscriptions = self.subscriptions.lock();
        if let Some(subscribers) = subscriptions.get_mut(agent_id) {
            subscribers.retain(|(id, _)| *id != subscription);
            if subscribers.is_empty() {
                subscriptions.remove(agent_id);
            }
        }
    }

    fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }
}
