//! ---
//! ams_section: "04-agent-protocols"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Protocol contract and value processing for agents."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use r_ams_model::agent::ModbusConfig;
use r_ams_model::asset::THING_ASSET_TYPE;
use r_ams_model::{
    AgentLink, Asset, AssetTreeNode, Attribute, AttributeEvent, AttributeRef, ConnectionStatus,
    Value, ValueDescriptor, ValueType,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{
    DiscoveryCallback, Protocol, ProtocolAssetService, ProtocolCapabilities, ProtocolCore,
    ProtocolError, Result,
};

/// Link property holding the holding-register address of an attribute.
pub const REGISTER: &str = "register";
/// Attribute created for every imported register.
pub const IMPORTED_ATTRIBUTE: &str = "value";

/// In-memory bank of 16-bit holding registers.
#[derive(Debug, Default)]
pub struct RegisterBank {
    registers: Mutex<HashMap<u16, u16>>,
}

impl RegisterBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a range of holding registers; unset registers read as zero.
    pub async fn read_holding_registers(&self, start: u16, count: u16) -> anyhow::Result<Vec<u16>> {
        let registers = self.registers.lock().await;
        let mut values = Vec::with_capacity(count as usize);
        for offset in 0..count {
            let addr = start
                .checked_add(offset)
                .ok_or_else(|| anyhow!("register range {start}+{count} overflows"))?;
            values.push(*registers.get(&addr).unwrap_or(&0));
        }
        Ok(values)
    }

    pub async fn write_holding_register(&self, address: u16, value: u16) -> anyhow::Result<()> {
        let mut registers = self.registers.lock().await;
        registers.insert(address, value);
        Ok(())
    }

    /// Snapshot of the requested addresses.
    async fn snapshot(&self, addresses: &[u16]) -> HashMap<u16, u16> {
        let registers = self.registers.lock().await;
        addresses
            .iter()
            .map(|addr| (*addr, *registers.get(addr).unwrap_or(&0)))
            .collect()
    }
}

struct ModbusInner {
    core: ProtocolCore,
    config: ModbusConfig,
    registers: Arc<RegisterBank>,
    addresses: parking_lot::RwLock<HashMap<AttributeRef, u16>>,
    last_polled: parking_lot::Mutex<HashMap<AttributeRef, u16>>,
}

impl ModbusInner {
    async fn poll_once(&self) {
        let linked: Vec<(AttributeRef, u16)> = self
            .addresses
            .read()
            .iter()
            .map(|(reference, addr)| (reference.clone(), *addr))
            .collect();
        if linked.is_empty() {
            return;
        }
        let addresses: Vec<u16> = linked.iter().map(|(_, addr)| *addr).collect();
        let snapshot = self.registers.snapshot(&addresses).await;
        for (reference, addr) in linked {
            let Some(current) = snapshot.get(&addr).copied() else {
                continue;
            };
            let changed = {
                let mut last = self.last_polled.lock();
                last.insert(reference.clone(), current) != Some(current)
            };
            if changed {
                self.core
                    .update_linked_attribute(&reference, Value::from(current));
            }
        }
    }
}

/// Modbus protocol over an in-memory register bank.
///
/// Linked attributes map to holding registers through the `register` link property.
/// Writes store integers; a poll task pushes changed registers back as sensor updates.
pub struct ModbusProtocol {
    inner: Arc<ModbusInner>,
    poller: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ModbusProtocol {
    pub const NAME: &'static str = "modbus";

    pub fn new(agent_id: impl Into<String>, config: ModbusConfig) -> Self {
        Self::with_registers(agent_id, config, Arc::new(RegisterBank::new()))
    }

    pub fn with_registers(
        agent_id: impl Into<String>,
        config: ModbusConfig,
        registers: Arc<RegisterBank>,
    ) -> Self {
        Self {
            inner: Arc::new(ModbusInner {
                core: ProtocolCore::new(Self::NAME, agent_id),
                config,
                registers,
                addresses: parking_lot::RwLock::new(HashMap::new()),
                last_polled: parking_lot::Mutex::new(HashMap::new()),
            }),
            poller: parking_lot::Mutex::new(None),
        }
    }

    pub fn registers(&self) -> Arc<RegisterBank> {
        self.inner.registers.clone()
    }

    /// Read every linked register once and publish changed values.
    pub async fn poll(&self) {
        self.inner.poll_once().await;
    }

    fn register_of(link: &AgentLink, reference: &AttributeRef) -> Result<u16> {
        let raw = link.require(REGISTER)?;
        raw.as_u64()
            .and_then(|addr| u16::try_from(addr).ok())
            .ok_or_else(|| ProtocolError::InvalidLink {
                reference: reference.clone(),
                reason: format!("register {raw} is not a 16-bit address"),
            })
    }
}

#[async_trait]
impl Protocol for ModbusProtocol {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn agent_id(&self) -> &str {
        self.inner.core.agent_id()
    }

    fn capabilities(&self) -> ProtocolCapabilities {
        ProtocolCapabilities {
            asset_discovery: false,
            asset_import: true,
        }
    }

    fn start(&self, context: Arc<dyn ProtocolAssetService>) -> Result<()> {
        self.inner.core.attach(context);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let weak = Arc::downgrade(&self.inner);
                let period = self.inner.config.poll_interval;
                let task = handle.spawn(async move {
                    let mut ticker =
                        tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                    loop {
                        ticker.tick().await;
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        inner.poll_once().await;
                    }
                });
                *self.poller.lock() = Some(task);
            }
            Err(_) => {
                warn!(agent_id = %self.agent_id(), "no async runtime; register polling disabled");
            }
        }
        info!(
            agent_id = %self.agent_id(),
            unit_id = self.inner.config.unit_id,
            poll_ms = self.inner.config.poll_interval.as_millis() as u64,
            "modbus protocol started"
        );
        self.inner.core.publish_status(ConnectionStatus::Connected);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if let Some(task) = self.poller.lock().take() {
            task.abort();
        }
        self.inner.core.publish_status(ConnectionStatus::Disconnected);
        self.inner.addresses.write().clear();
        self.inner.last_polled.lock().clear();
        self.inner.core.clear();
        self.inner.core.detach();
        info!(agent_id = %self.agent_id(), "modbus protocol stopped");
        Ok(())
    }

    fn link_attribute(&self, asset_id: &str, attribute: &Attribute) -> Result<()> {
        let reference = AttributeRef::new(asset_id, attribute.name());
        let entry = self.inner.core.link(asset_id, attribute)?;
        let register = match Self::register_of(&entry.link, &reference) {
            Ok(register) => register,
            Err(err) => {
                self.inner.core.unlink(asset_id, attribute);
                return Err(err);
            }
        };
        debug!(attribute = %reference, register, "register linked");
        self.inner.addresses.write().insert(reference, register);
        Ok(())
    }

    fn unlink_attribute(&self, asset_id: &str, attribute: &Attribute) -> Result<()> {
        let reference = AttributeRef::new(asset_id, attribute.name());
        self.inner.core.unlink(asset_id, attribute);
        self.inner.addresses.write().remove(&reference);
        self.inner.last_polled.lock().remove(&reference);
        Ok(())
    }

    fn linked_attributes(&self) -> Vec<(AttributeRef, Attribute)> {
        self.inner.core.linked_attributes()
    }

    fn is_linked(&self, reference: &AttributeRef) -> bool {
        self.inner.core.is_linked(reference)
    }

    async fn process_linked_attribute_write(&self, event: AttributeEvent) -> Result<()> {
        let reference = event.reference().clone();
        let Some(value) = self.inner.core.outbound_value(&event)? else {
            return Ok(());
        };
        let Some(address) = self.inner.addresses.read().get(&reference).copied() else {
            return Err(ProtocolError::NotLinked(reference));
        };
        let write_error = |reason: String| ProtocolError::Write {
            reference: reference.clone(),
            reason,
        };
        let numeric = match &value {
            Value::Bool(flag) => i64::from(*flag),
            other => other
                .as_i64()
                .ok_or_else(|| write_error("modbus register writes require integer payloads".into()))?,
        };
        if !(0..=u16::MAX as i64).contains(&numeric) {
            return Err(write_error(format!("value {numeric} out of range for 16-bit register")));
        }
        self.inner
            .registers
            .write_holding_register(address, numeric as u16)
            .await
            .map_err(|err| write_error(err.to_string()))?;
        debug!(attribute = %reference, register = address, value = numeric, "register written");
        self.inner.poll_once().await;
        Ok(())
    }

    async fn start_asset_import(
        &self,
        data: Vec<u8>,
        callback: DiscoveryCallback,
    ) -> anyhow::Result<()> {
        let text = String::from_utf8(data).context("import payload is not UTF-8")?;
        let agent_id = self.agent_id().to_owned();
        let mut nodes = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let (name, register) = match fields.as_slice() {
                [name, register, ..] if !name.is_empty() => (*name, *register),
                _ => bail!("line {}: expected name,register[,valueType]", index + 1),
            };
            let register: u16 = register
                .parse()
                .with_context(|| format!("line {}: invalid register '{register}'", index + 1))?;
            let value_type = fields
                .get(2)
                .filter(|t| !t.is_empty())
                .map(|t| ValueDescriptor::resolve(t))
                .unwrap_or_else(|| ValueType::Integer.into());
            let link = AgentLink::new(agent_id.clone()).with_property(REGISTER, Value::from(register));
            let asset = Asset::new(name, THING_ASSET_TYPE)
                .with_parent(agent_id.clone())
                .with_attribute(Attribute::new(IMPORTED_ATTRIBUTE, value_type).with_agent_link(&link));
            nodes.push(AssetTreeNode::new(asset));
        }
        info!(agent_id = %agent_id, assets = nodes.len(), "modbus import parsed");
        callback(nodes);
        Ok(())
    }
}

impl Drop for ModbusProtocol {
    fn drop(&mut self) {
        if let Some(task) = self.poller.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChildAssetConsumer, SubscriptionId};
    use r_ams_common::{Clock, FixedClock};
    use r_ams_model::AssetQuery;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct Sink {
        events: parking_lot::Mutex<Vec<AttributeEvent>>,
        clock: FixedClock,
    }

    impl ProtocolAssetService for Sink {
        fn send_attribute_event(&self, event: AttributeEvent) {
            self.events.lock().push(event);
        }
        fn merge_asset(&self, _agent_id: &str, asset: Asset) -> anyhow::Result<Asset> {
            Ok(asset)
        }
        fn delete_assets(&self, _agent_id: &str, _ids: &[String]) -> anyhow::Result<bool> {
            Ok(false)
        }
        fn find_asset(&self, _agent_id: &str, _asset_id: &str) -> Option<Asset> {
            None
        }
        fn find_assets(&self, _agent_id: &str, _query: AssetQuery) -> Vec<Asset> {
            Vec::new()
        }
        fn subscribe_child_asset_change(&self, _: &str, _: ChildAssetConsumer) -> SubscriptionId {
            SubscriptionId(1)
        }
        fn unsubscribe_child_asset_change(&self, _: &str, _: SubscriptionId) {}
        fn clock(&self) -> &dyn Clock {
            &self.clock
        }
    }

    fn config() -> ModbusConfig {
        ModbusConfig {
            unit_id: 1,
            poll_interval: Duration::from_secs(3600),
        }
    }

    fn register_attribute(register: Value) -> Attribute {
        Attribute::new("setpoint", ValueType::Integer)
            .with_agent_link(&AgentLink::new("plc").with_property(REGISTER, register))
    }

    #[tokio::test]
    async fn register_bank_read_write_cycle() {
        let bank = RegisterBank::new();
        bank.write_holding_register(1, 123).await.unwrap();
        bank.write_holding_register(3, 789).await.unwrap();
        let values = bank.read_holding_registers(1, 3).await.unwrap();
        assert_eq!(values, vec![123, 0, 789]);
        assert!(bank.read_holding_registers(u16::MAX, 2).await.is_err());
    }

    #[tokio::test]
    async fn write_stores_register_and_echoes() {
        let sink = Arc::new(Sink::default());
        let protocol = ModbusProtocol::new("plc", config());
        protocol.start(sink.clone()).unwrap();
        protocol
            .link_attribute("pump", &register_attribute(json!(40)))
            .unwrap();

        let reference = AttributeRef::new("pump", "setpoint");
        protocol
            .process_linked_attribute_write(AttributeEvent::new(reference.clone(), json!(512)))
            .await
            .unwrap();
        assert_eq!(
            protocol.registers().read_holding_registers(40, 1).await.unwrap(),
            vec![512]
        );
        let last = sink.events.lock().last().cloned().unwrap();
        assert_eq!(last.reference(), &reference);
        assert_eq!(last.value(), &json!(512));

        let err = protocol
            .process_linked_attribute_write(AttributeEvent::new(reference, json!(70_000)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Write { .. }));
        protocol.stop().unwrap();
    }

    #[tokio::test]
    async fn poll_publishes_only_changes() {
        let sink = Arc::new(Sink::default());
        let bank = Arc::new(RegisterBank::new());
        let protocol = ModbusProtocol::with_registers("plc", config(), bank.clone());
        protocol.start(sink.clone()).unwrap();
        protocol
            .link_attribute("pump", &register_attribute(json!(7)))
            .unwrap();
        let before = sink.events.lock().len();

        bank.write_holding_register(7, 5).await.unwrap();
        protocol.poll().await;
        protocol.poll().await;
        assert_eq!(sink.events.lock().len(), before + 1);
        protocol.stop().unwrap();
    }

    #[test]
    fn link_requires_valid_register() {
        let protocol = ModbusProtocol::new("plc", config());
        assert!(protocol
            .link_attribute("pump", &register_attribute(json!(-1)))
            .is_err());
        assert!(!protocol.is_linked(&AttributeRef::new("pump", "setpoint")));
        let missing = Attribute::new("setpoint", ValueType::Integer)
            .with_agent_link(&AgentLink::new("plc"));
        assert!(protocol.link_attribute("pump", &missing).is_err());
    }

    #[tokio::test]
    async fn import_parses_csv_rows() {
        let protocol = ModbusProtocol::new("plc", config());
        let collected = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = collected.clone();
        protocol
            .start_asset_import(
                b"# name,register,type\npump,10\nfan,11,boolean\n".to_vec(),
                Arc::new(move |nodes: Vec<AssetTreeNode>| sink.lock().extend(nodes)),
            )
            .await
            .unwrap();
        let nodes = collected.lock();
        assert_eq!(nodes.len(), 2);
        let fan = &nodes[1].asset;
        assert_eq!(fan.parent_id.as_deref(), Some("plc"));
        let attribute = fan.attribute(IMPORTED_ATTRIBUTE).unwrap();
        assert_eq!(attribute.value_type().base(), ValueType::Boolean);
        let link = attribute.agent_link().unwrap().unwrap();
        assert_eq!(link.property(REGISTER), Some(&json!(11)));

        assert!(protocol
            .start_asset_import(b"broken".to_vec(), Arc::new(|_: Vec<AssetTreeNode>| {}))
            .await
            .is_err());
    }
}
