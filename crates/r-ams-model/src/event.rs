//! ---
//! ams_section: "02-asset-model"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Typed asset and attribute model."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
use std::fmt;

use r_ams_common::now_millis;
use serde::{Deserialize, Serialize};

use crate::asset::Asset;
use crate::value::Value;

/// Identifies one attribute of one asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeRef {
    pub asset_id: String,
    pub name: String,
}

impl AttributeRef {
    pub fn new(asset_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.asset_id, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeState {
    #[serde(rename = "ref")]
    pub reference: AttributeRef,
    #[serde(default)]
    pub value: Value,
}

impl AttributeState {
    pub fn new(reference: AttributeRef, value: Value) -> Self {
        Self { reference, value }
    }
}

/// A timestamped attribute value change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeEvent {
    pub state: AttributeState,
    pub timestamp: i64,
}

impl AttributeEvent {
    pub fn new(reference: AttributeRef, value: Value) -> Self {
        Self::at(reference, value, now_millis())
    }

    pub fn at(reference: AttributeRef, value: Value, timestamp: i64) -> Self {
        Self {
            state: AttributeState::new(reference, value),
            timestamp,
        }
    }

    pub fn reference(&self) -> &AttributeRef {
        &self.state.reference
    }

    pub fn asset_id(&self) -> &str {
        &self.state.reference.asset_id
    }

    pub fn name(&self) -> &str {
        &self.state.reference.name
    }

    pub fn value(&self) -> &Value {
        &self.state.value
    }
}

/// Origin of an attribute write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Source {
    Client,
    Internal,
    Sensor,
    Gateway,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PersistenceCause {
    Create,
    Update,
    Delete,
}

pub const PROPERTY_NAME: &str = "name";
pub const PROPERTY_PARENT: &str = "parentId";
pub const PROPERTY_PATH: &str = "path";
pub const PROPERTY_ATTRIBUTES: &str = "attributes";

/// Change-feed notification emitted by the asset store after a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceEvent {
    pub cause: PersistenceCause,
    pub entity: Asset,
    pub previous: Option<Asset>,
    pub changed_properties: Vec<&'static str>,
}

impl PersistenceEvent {
    pub fn created(entity: Asset) -> Self {
        Self {
            cause: PersistenceCause::Create,
            entity,
            previous: None,
            changed_properties: Vec::new(),
        }
    }

    pub fn updated(previous: Asset, entity: Asset) -> Self {
        let mut changed_properties = Vec::new();
        if previous.name != entity.name {
            changed_properties.push(PROPERTY_NAME);
        }
        if previous.parent_id != entity.parent_id {
            changed_properties.push(PROPERTY_PARENT);
        }
        if previous.path != entity.path {
            changed_properties.push(PROPERTY_PATH);
        }
        if previous.attributes != entity.attributes {
            changed_properties.push(PROPERTY_ATTRIBUTES);
        }
        Self {
            cause: PersistenceCause::Update,
            entity,
            previous: Some(previous),
            changed_properties,
        }
    }

    pub fn deleted(entity: Asset) -> Self {
        Self {
            cause: PersistenceCause::Delete,
            entity,
            previous: None,
            changed_properties: Vec::new(),
        }
    }

    pub fn touched(&self, property: &str) -> bool {
        self.changed_properties.iter().any(|p| *p == property)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::THING_ASSET_TYPE;
    use crate::attribute::Attribute;
    use crate::value::ValueType;
    use serde_json::json;

    #[test]
    fn update_tracks_changed_properties() {
        let before = Asset::new("pump", THING_ASSET_TYPE).with_id("p1");
        let mut after = before.clone();
        after.name = "pump-2".into();
        after
            .attributes
            .add_or_replace(Attribute::new("flow", ValueType::Number));
        let event = PersistenceEvent::updated(before, after);
        assert!(event.touched(PROPERTY_NAME));
        assert!(event.touched(PROPERTY_ATTRIBUTES));
        assert!(!event.touched(PROPERTY_PARENT));
    }

    #[test]
    fn attribute_event_serializes_reference() {
        let event = AttributeEvent::at(AttributeRef::new("a1", "temp"), json!(21), 5);
        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(encoded["state"]["ref"]["assetId"], json!("a1"));
        assert_eq!(event.reference().to_string(), "a1:temp");
    }
}
