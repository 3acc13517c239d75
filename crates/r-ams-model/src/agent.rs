//! ---
//! ams_section: "02-asset-model"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Typed asset and attribute model."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
//! Typed view over agent assets.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::asset::Asset;
use crate::attribute::Attribute;
use crate::error::{ModelError, Result};
use crate::value::{Value, ValueType};

/// Reserved attribute toggling whether the agent's protocol runs.
pub const DISABLED: &str = "disabled";
/// Reserved attribute carrying the agent's [`ConnectionStatus`].
pub const AGENT_STATUS: &str = "agentStatus";
/// Mock agent: when true, links must carry a `requiredValue` property.
pub const REQUIRED_TEST: &str = "requiredTest";
/// Mock agent: device names announced during asset discovery.
pub const DISCOVERY_DEVICES: &str = "discoveryDevices";
/// Modbus agent: unit identifier of the device.
pub const UNIT_ID: &str = "unitId";
/// Modbus agent: register poll interval in milliseconds.
pub const POLL_INTERVAL: &str = "pollIntervalMillis";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1_000);

/// Closed set of agent implementations known to the runtime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr, EnumIter,
)]
pub enum AgentKind {
    MockAgent,
    ModbusAgent,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
    Disabled,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Ready,
    RequestStart,
    RequestCancel,
    Running,
    Completed,
    Cancelled,
    Error,
}

impl ExecutionStatus {
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_str().and_then(|s| Self::from_str(s).ok())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockConfig {
    pub required_test: bool,
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusConfig {
    pub unit_id: u8,
    pub poll_interval: Duration,
}

/// Kind specific configuration read from an agent's attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentConfig {
    Mock(MockConfig),
    Modbus(ModbusConfig),
}

/// An asset whose type is one of the [`AgentKind`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct Agent {
    kind: AgentKind,
    asset: Asset,
}

impl Agent {
    /// Build a new agent asset with the reserved attributes present.
    pub fn new(kind: AgentKind, name: impl Into<String>) -> Self {
        let asset = Asset::new(name, kind.to_string())
            .with_attribute(Attribute::new(DISABLED, ValueType::Boolean).with_value(json!(false)))
            .with_attribute(Attribute::new(AGENT_STATUS, ValueType::ConnectionStatus));
        Self { kind, asset }
    }

    pub fn from_asset(asset: Asset) -> Result<Self> {
        let kind =
            AgentKind::from_str(&asset.asset_type).map_err(|_| ModelError::NotAnAgent {
                asset_id: asset.id.clone(),
                asset_type: asset.asset_type.clone(),
            })?;
        Ok(Self { kind, asset })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.asset = self.asset.with_id(id);
        self
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.add_or_replace_attribute(attribute);
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.add_or_replace_attribute(
            Attribute::new(DISABLED, ValueType::Boolean).with_value(json!(disabled)),
        );
        self
    }

    pub fn add_or_replace_attribute(&mut self, attribute: Attribute) {
        self.asset.attributes.add_or_replace(attribute);
    }

    pub fn id(&self) -> &str {
        &self.asset.id
    }

    pub fn name(&self) -> &str {
        &self.asset.name
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    pub fn asset(&self) -> &Asset {
        &self.asset
    }

    pub fn into_asset(self) -> Asset {
        self.asset
    }

    pub fn is_disabled(&self) -> bool {
        self.bool_attribute(DISABLED).unwrap_or(false)
    }

    pub fn status(&self) -> Option<ConnectionStatus> {
        self.asset
            .attribute(AGENT_STATUS)
            .and_then(|attribute| attribute.value().as_str())
            .and_then(|s| ConnectionStatus::from_str(s).ok())
    }

    /// Parse the kind specific configuration.
    pub fn config(&self) -> Result<AgentConfig> {
        match self.kind {
            AgentKind::MockAgent => {
                let devices = match self.asset.attribute(DISCOVERY_DEVICES).map(Attribute::value) {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(|item| {
                            item.as_str().map(str::to_owned).ok_or_else(|| {
                                self.invalid(format!("{DISCOVERY_DEVICES} entries must be strings"))
                            })
                        })
                        .collect::<Result<Vec<_>>>()?,
                    Some(_) => {
                        return Err(self.invalid(format!("{DISCOVERY_DEVICES} must be an array")))
                    }
                };
                Ok(AgentConfig::Mock(MockConfig {
                    required_test: self.bool_attribute(REQUIRED_TEST).unwrap_or(false),
                    devices,
                }))
            }
            AgentKind::ModbusAgent => {
                let unit_id = match self.int_attribute(UNIT_ID) {
                    None => 1,
                    Some(raw) => u8::try_from(raw)
                        .map_err(|_| self.invalid(format!("{UNIT_ID} {raw} out of range")))?,
                };
                let poll_interval = match self.int_attribute(POLL_INTERVAL) {
                    None => DEFAULT_POLL_INTERVAL,
                    Some(millis) if millis > 0 => Duration::from_millis(millis as u64),
                    Some(millis) => {
                        return Err(self.invalid(format!("{POLL_INTERVAL} must be positive, got {millis}")))
                    }
                };
                Ok(AgentConfig::Modbus(ModbusConfig {
                    unit_id,
                    poll_interval,
                }))
            }
        }
    }

    fn bool_attribute(&self, name: &str) -> Option<bool> {
        self.asset
            .attribute(name)
            .and_then(|attribute| attribute.value().as_bool())
    }

    fn int_attribute(&self, name: &str) -> Option<i64> {
        self.asset
            .attribute(name)
            .and_then(|attribute| attribute.value().as_i64())
    }

    fn invalid(&self, reason: String) -> ModelError {
        ModelError::InvalidAgentConfig {
            agent_id: self.id().to_owned(),
            reason,
        }
    }
}
