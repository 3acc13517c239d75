//! ---
//! ams_section: "02-asset-model"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Typed asset and attribute model."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::error::{ModelError, Result};
use crate::filter::ValueFilter;
use crate::predicate::ValuePredicate;
use crate::value::Value;

/// Meta item name carrying an [`AgentLink`].
pub const AGENT_LINK: &str = "agentLink";
/// Token in `writeValue` templates replaced by the written value.
pub const DYNAMIC_VALUE_PLACEHOLDER: &str = "$value";
/// Rendering of a null value inside a `writeValue` template.
pub const NULL_LITERAL: &str = "null";

/// Per-attribute link to an agent and the value transformation rules for that link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentLink {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_filters: Option<Vec<ValueFilter>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_converter: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_value_converter: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_match_predicate: Option<ValuePredicate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_match_filters: Option<Vec<ValueFilter>>,
    /// Protocol specific properties such as `register` or `requiredValue`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AgentLink {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            id: agent_id.into(),
            value_filters: None,
            value_converter: None,
            write_value_converter: None,
            write_value: None,
            message_match_predicate: None,
            message_match_filters: None,
            extra: Map::new(),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone()).map_err(ModelError::InvalidAgentLink)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn with_value_filters(mut self, filters: Vec<ValueFilter>) -> Self {
        self.value_filters = Some(filters);
        self
    }

    pub fn with_value_converter(mut self, converter: Map<String, Value>) -> Self {
        self.value_converter = Some(converter);
        self
    }

    pub fn with_write_value_converter(mut self, converter: Map<String, Value>) -> Self {
        self.write_value_converter = Some(converter);
        self
    }

    pub fn with_write_value(mut self, template: impl Into<String>) -> Self {
        self.write_value = Some(template.into());
        self
    }

    pub fn with_message_match(
        mut self,
        predicate: ValuePredicate,
        filters: Option<Vec<ValueFilter>>,
    ) -> Self {
        self.message_match_predicate = Some(predicate);
        self.message_match_filters = filters;
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }

    /// Fetch a protocol specific property that must be present.
    pub fn require(&self, name: &str) -> Result<&Value> {
        self.extra
            .get(name)
            .filter(|value| !value.is_null())
            .ok_or_else(|| ModelError::MissingAgentLinkProperty {
                agent_id: self.id.clone(),
                property: name.to_owned(),
            })
    }

    /// Whether the write value template references the dynamic placeholder.
    pub fn has_dynamic_write_value(&self) -> bool {
        self.write_value
            .as_deref()
            .is_some_and(|template| template.contains(DYNAMIC_VALUE_PLACEHOLDER))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_camel_case_with_extra_properties() {
        let link = AgentLink::from_value(&json!({
            "id": "agent-1",
            "writeValue": "{\"cmd\":\"$value\"}",
            "valueConverter": {"ON": true},
            "register": 40001
        }))
        .unwrap();
        assert_eq!(link.id, "agent-1");
        assert!(link.has_dynamic_write_value());
        assert_eq!(link.property("register"), Some(&json!(40001)));
        assert_eq!(link.to_value()["register"], json!(40001));
    }

    #[test]
    fn require_reports_missing_property() {
        let link = AgentLink::new("agent-1");
        let err = link.require("requiredValue").unwrap_err();
        assert!(matches!(
            err,
            ModelError::MissingAgentLinkProperty { ref property, .. } if property == "requiredValue"
        ));
    }

    #[test]
    fn missing_id_is_invalid() {
        assert!(AgentLink::from_value(&json!({"writeValue": "x"})).is_err());
    }
}
