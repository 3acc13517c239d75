//! ---
//! ams_section: "05-linking-core"
//! ams_subsection: "tests"
//! ams_type: "source"
//! ams_scope: "test"
//! ams_description: "Asset and instance discovery through the linking service."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use r_ams_agent::protocols::MockInstanceDiscovery;
use r_ams_agent::{
    DefaultProtocolFactory, DiscoveryCallback, Protocol, ProtocolAssetService,
    ProtocolCapabilities, ProtocolCore, ProtocolFactory,
};
use r_ams_core::{
    AgentService, AssetStore, BusReceivers, ChannelBus, DiscoveryError, InMemoryAssetStore,
    TaskKind, TaskOutcome,
};
use r_ams_model::agent::DISCOVERY_DEVICES;
use r_ams_model::{
    Agent, AgentKind, Asset, AssetTreeNode, Attribute, AttributeEvent, AttributeRef, ValueType,
};
use serde_json::json;

struct Fixture {
    store: Arc<InMemoryAssetStore>,
    service: Arc<AgentService>,
    _receivers: BusReceivers,
}

fn service_with(seed: Vec<Asset>) -> Fixture {
    service_with_factory(seed, Arc::new(DefaultProtocolFactory))
}

fn service_with_factory(seed: Vec<Asset>, factory: Arc<dyn ProtocolFactory>) -> Fixture {
    let store = Arc::new(InMemoryAssetStore::new());
    for asset in seed {
        store.merge(asset).unwrap();
    }
    let (bus, receivers) = ChannelBus::new();
    let service = AgentService::builder(store.clone(), Arc::new(bus))
        .factory(factory)
        .build();
    service.start();
    Fixture {
        store,
        service,
        _receivers: receivers,
    }
}

fn discovering_agent(id: &str, devices: &[&str]) -> Asset {
    Agent::new(AgentKind::MockAgent, id)
        .with_id(id)
        .with_attribute(Attribute::new(DISCOVERY_DEVICES, ValueType::Json).with_value(json!(devices)))
        .into_asset()
}

/// Agents named `stalled*` get a protocol whose asset discovery never completes.
struct StalledFactory;

impl ProtocolFactory for StalledFactory {
    fn create(&self, agent: &Agent) -> r_ams_agent::Result<Arc<dyn Protocol>> {
        if agent.name().starts_with("stalled") {
            return Ok(Arc::new(StalledProtocol {
                core: ProtocolCore::new("stalled", agent.id()),
            }));
        }
        DefaultProtocolFactory.create(agent)
    }
}

struct StalledProtocol {
    core: ProtocolCore,
}

#[async_trait]
impl Protocol for StalledProtocol {
    fn name(&self) -> &'static str {
        "stalled"
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

    fn start(&self, context: Arc<dyn ProtocolAssetService>) -> r_ams_agent::Result<()> {
        self.core.attach(context);
        Ok(())
    }

    fn stop(&self) -> r_ams_agent::Result<()> {
        self.core.detach();
        self.core.clear();
        Ok(())
    }

    fn link_attribute(&self, asset_id: &str, attribute: &Attribute) -> r_ams_agent::Result<()> {
        self.core.link(asset_id, attribute).map(|_| ())
    }

    fn unlink_attribute(&self, asset_id: &str, attribute: &Attribute) -> r_ams_agent::Result<()> {
        self.core.unlink(asset_id, attribute);
        Ok(())
    }

    fn linked_attributes(&self) -> Vec<(AttributeRef, Attribute)> {
        self.core.linked_attributes()
    }

    fn is_linked(&self, reference: &AttributeRef) -> bool {
        self.core.is_linked(reference)
    }

    async fn process_linked_attribute_write(
        &self,
        _event: AttributeEvent,
    ) -> r_ams_agent::Result<()> {
        Ok(())
    }

    async fn start_asset_discovery(&self, _callback: DiscoveryCallback) -> anyhow::Result<()> {
        std::future::pending::<anyhow::Result<()>>().await
    }
}

fn stalled_agent(id: &str) -> Agent {
    Agent::new(AgentKind::MockAgent, "stalled").with_id(id)
}

fn stalled_fixture() -> Fixture {
    service_with_factory(vec![stalled_agent("agent-1").into_asset()], Arc::new(StalledFactory))
}

fn noop() -> DiscoveryCallback {
    Arc::new(|_: Vec<AssetTreeNode>| {})
}

#[tokio::test]
async fn second_discovery_is_refused_while_the_first_runs() {
    let Fixture { service, _receivers, .. } = stalled_fixture();

    let first = service.do_protocol_asset_discovery("agent-1", noop()).unwrap();
    tokio::task::yield_now().await;
    assert!(service.is_discovery_running("agent-1"));

    assert!(matches!(
        service.do_protocol_asset_discovery("agent-1", noop()),
        Err(DiscoveryError::AlreadyRunning(id)) if id == "agent-1"
    ));
    tokio::task::yield_now().await;
    assert!(!first.is_finished());
    assert!(service.is_discovery_running("agent-1"));

    first.abort();
    assert_eq!(first.join().await, TaskOutcome::Cancelled);
    assert!(!service.is_discovery_running("agent-1"));
}

#[tokio::test]
async fn stopping_the_agent_cancels_its_discovery() {
    let Fixture { service, _receivers, .. } = stalled_fixture();

    let task = service.do_protocol_asset_discovery("agent-1", noop()).unwrap();
    tokio::task::yield_now().await;
    service.stop_agent("agent-1");

    assert!(!service.is_discovery_running("agent-1"));
    assert_eq!(task.join().await, TaskOutcome::Cancelled);
    assert!(matches!(
        service.do_protocol_asset_discovery("agent-1", noop()),
        Err(DiscoveryError::AgentNotRunning(_))
    ));
}

#[tokio::test]
async fn restarting_the_agent_cancels_and_frees_the_slot() {
    let Fixture { store, service, _receivers } = stalled_fixture();

    let task = service.do_protocol_asset_discovery("agent-1", noop()).unwrap();
    tokio::task::yield_now().await;

    let updated = stalled_agent("agent-1")
        .with_attribute(Attribute::new("notes", ValueType::Text).with_value(json!("moved")))
        .into_asset();
    store.merge(updated).unwrap();

    assert!(service.is_running("agent-1"));
    assert!(!service.is_discovery_running("agent-1"));
    assert_eq!(task.join().await, TaskOutcome::Cancelled);

    let next = service.do_protocol_asset_discovery("agent-1", noop()).unwrap();
    assert!(service.is_discovery_running("agent-1"));
    next.abort();
    assert_eq!(next.join().await, TaskOutcome::Cancelled);
}

#[tokio::test]
async fn service_stop_cancels_running_discovery() {
    let Fixture { service, _receivers, .. } = stalled_fixture();

    let task = service.do_protocol_asset_discovery("agent-1", noop()).unwrap();
    tokio::task::yield_now().await;
    service.stop();

    assert!(!service.is_discovery_running("agent-1"));
    assert_eq!(task.join().await, TaskOutcome::Cancelled);
}

#[tokio::test]
async fn discovered_assets_can_be_merged_beneath_the_agent() {
    let Fixture { store, service, _receivers } =
        service_with(vec![discovering_agent("agent-1", &["pump", "valve"])]);

    let found = Arc::new(Mutex::new(Vec::<AssetTreeNode>::new()));
    let sink = found.clone();
    let task = service
        .do_protocol_asset_discovery(
            "agent-1",
            Arc::new(move |nodes: Vec<AssetTreeNode>| sink.lock().extend(nodes)),
        )
        .unwrap();
    assert_eq!(task.kind(), TaskKind::AssetDiscovery);
    assert_eq!(task.join().await, TaskOutcome::Completed);
    assert!(!service.is_discovery_running("agent-1"));

    let nodes = std::mem::take(&mut *found.lock());
    assert_eq!(nodes.len(), 2);
    let merged = service.merge_discovered_assets("agent-1", nodes).unwrap();
    assert_eq!(merged, 2);

    let names: Vec<String> = store
        .find_all(&r_ams_model::AssetQuery::new().parents(["agent-1"]))
        .into_iter()
        .map(|asset| asset.name)
        .collect();
    assert_eq!(names, vec!["pump".to_owned(), "valve".to_owned()]);
}

#[tokio::test]
async fn unsupported_and_stopped_agents_are_rejected_synchronously() {
    let Fixture { service, _receivers, .. } = service_with(vec![
        discovering_agent("agent-1", &[]),
        Agent::new(AgentKind::MockAgent, "off")
            .with_id("off")
            .with_disabled(true)
            .into_asset(),
    ]);
    let noop = Arc::new(|_: Vec<AssetTreeNode>| {});

    assert!(matches!(
        service.do_protocol_asset_import("agent-1", b"x".to_vec(), noop.clone()),
        Err(DiscoveryError::Unsupported { .. })
    ));
    assert!(matches!(
        service.do_protocol_asset_discovery("off", noop.clone()),
        Err(DiscoveryError::AgentNotRunning(_))
    ));
    assert!(matches!(
        service.do_protocol_asset_discovery("missing", noop),
        Err(DiscoveryError::AgentNotRunning(_))
    ));
}

#[tokio::test]
async fn modbus_import_reports_register_assets() {
    let Fixture { service, _receivers, .. } = service_with(vec![Agent::new(AgentKind::ModbusAgent, "plc")
        .with_id("plc")
        .into_asset()]);

    let found = Arc::new(Mutex::new(0usize));
    let sink = found.clone();
    let task = service
        .do_protocol_asset_import(
            "plc",
            b"# name,register\ntemperature,40001\nspeed,40002,number\n".to_vec(),
            Arc::new(move |nodes: Vec<AssetTreeNode>| {
                *sink.lock() += nodes.iter().map(AssetTreeNode::size).sum::<usize>();
            }),
        )
        .unwrap();
    assert_eq!(task.join().await, TaskOutcome::Completed);
    assert_eq!(*found.lock(), 2);

    service.stop();
}

#[tokio::test]
async fn instance_discovery_runs_detached() {
    let Fixture { store, service, _receivers } = service_with(Vec::new());
    store.merge(Asset::new("site", "Site").with_id("site")).unwrap();

    let found = Arc::new(Mutex::new(Vec::new()));
    let sink = found.clone();
    let task = service
        .do_protocol_instance_discovery(
            Some("site"),
            Arc::new(MockInstanceDiscovery::new(["m1", "m2"])),
            Arc::new(move |agents: Vec<Agent>| {
                sink.lock().extend(agents.into_iter().map(|agent| agent.name().to_owned()))
            }),
        )
        .unwrap();
    assert_eq!(task.target(), "site");
    assert_eq!(task.join().await, TaskOutcome::Completed);
    assert_eq!(*found.lock(), vec!["m1".to_owned(), "m2".to_owned()]);
}

#[tokio::test]
async fn instance_discovery_refuses_gateway_parents() {
    let Fixture { store, service, _receivers } = service_with(Vec::new());
    store.merge(Asset::new("gw", "GatewayAsset").with_id("gw")).unwrap();

    let result = service.do_protocol_instance_discovery(
        Some("gw"),
        Arc::new(MockInstanceDiscovery::new(["m1"])),
        Arc::new(|_: Vec<Agent>| {}),
    );
    assert!(matches!(result, Err(DiscoveryError::GatewayParent(_))));
}
