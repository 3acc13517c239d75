//! ---
//! ams_section: "02-asset-model"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Typed asset and attribute model."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
use indexmap::IndexMap;
use r_ams_common::now_millis;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::agent_link::{AgentLink, AGENT_LINK};
use crate::error::Result;
use crate::value::{Value, ValueDescriptor};

/// Meta items keyed by name; a name appears at most once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetaList(IndexMap<String, Value>);

impl MetaList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` under `name`, replacing any previous item of that name.
    pub fn add_or_replace(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(name.into(), value)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.shift_remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Named, typed value holder.
///
/// The timestamp is signed: a negative value means the time was assigned by the system
/// and is pending persistence, a positive value is an explicit event time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    name: String,
    #[serde(rename = "type")]
    value_type: ValueDescriptor,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    timestamp: i64,
    #[serde(default, skip_serializing_if = "MetaList::is_empty")]
    meta: MetaList,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value_type: impl Into<ValueDescriptor>) -> Self {
        Self {
            name: name.into(),
            value_type: value_type.into(),
            value: Value::Null,
            timestamp: 0,
            meta: MetaList::new(),
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.set_value(value);
        self
    }

    pub fn with_meta(mut self, name: impl Into<String>, value: Value) -> Self {
        self.meta.add_or_replace(name, value);
        self
    }

    pub fn with_agent_link(self, link: &AgentLink) -> Self {
        self.with_meta(AGENT_LINK, link.to_value())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value_type(&self) -> &ValueDescriptor {
        &self.value_type
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn meta(&self) -> &MetaList {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut MetaList {
        &mut self.meta
    }

    /// Set the value and stamp it with a system-assigned (negative) timestamp.
    pub fn set_value(&mut self, value: Value) {
        self.value = value;
        self.timestamp = -now_millis();
    }

    /// Set the value with an explicit event time.
    ///
    /// The explicit time is only kept when it is positive and newer than the current
    /// timestamp; otherwise the value is stamped as in [`Attribute::set_value`].
    pub fn set_value_at(&mut self, value: Value, timestamp: i64) {
        if timestamp > 0 && timestamp > self.timestamp {
            self.value = value;
            self.timestamp = timestamp;
        } else {
            warn!(
                attribute = %self.name,
                timestamp,
                current = self.timestamp,
                "explicit timestamp is not newer than current; using system time"
            );
            self.set_value(value);
        }
    }

    /// Explicit event time, if one has been recorded.
    pub fn timestamp(&self) -> Option<i64> {
        (self.timestamp > 0).then_some(self.timestamp)
    }

    /// Raw signed timestamp.
    pub fn raw_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn has_agent_link(&self) -> bool {
        self.meta.contains(AGENT_LINK)
    }

    /// Decode the agent link meta item, if present.
    pub fn agent_link(&self) -> Option<Result<AgentLink>> {
        self.meta.get(AGENT_LINK).map(AgentLink::from_value)
    }

    /// Equality over everything that affects linking: name, declared type and meta.
    pub fn link_configuration_eq(&self, other: &Attribute) -> bool {
        self.name == other.name && self.value_type == other.value_type && self.meta == other.meta
    }
}

/// Attributes of an asset keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Attribute>", into = "Vec<Attribute>")]
pub struct AttributeList(IndexMap<String, Attribute>);

impl AttributeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an attribute, replacing any previous attribute with the same name.
    pub fn add_or_replace(&mut self, attribute: Attribute) -> Option<Attribute> {
        self.0.insert(attribute.name.clone(), attribute)
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.0.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        self.0.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Attribute> {
        self.0.shift_remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Attributes of `self` that are absent from `other` or whose link configuration differs.
    pub fn added_or_modified<'a>(
        &'a self,
        other: &'a AttributeList,
    ) -> impl Iterator<Item = &'a Attribute> + 'a {
        self.iter().filter(move |attribute| {
            other
                .get(attribute.name())
                .map_or(true, |previous| !previous.link_configuration_eq(attribute))
        })
    }
}

impl From<Vec<Attribute>> for AttributeList {
    fn from(attributes: Vec<Attribute>) -> Self {
        attributes.into_iter().collect()
    }
}

impl From<AttributeList> for Vec<Attribute> {
    fn from(list: AttributeList) -> Self {
        list.0.into_values().collect()
    }
}

impl FromIterator<Attribute> for AttributeList {
    fn from_iter<I: IntoIterator<Item = Attribute>>(iter: I) -> Self {
        let mut list = AttributeList::new();
        for attribute in iter {
            list.add_or_replace(attribute);
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueType;
    use serde_json::json;

    #[test]
    fn system_timestamp_precedes_explicit_timestamp() {
        let mut attribute = Attribute::new("temp", ValueType::Number);
        attribute.set_value(json!(1.0));
        let pending = attribute.raw_timestamp();
        assert!(pending < 0);
        assert_eq!(attribute.timestamp(), None);

        let explicit = now_millis() + 10;
        attribute.set_value_at(json!(2.0), explicit);
        assert!(pending < attribute.raw_timestamp());
        assert_eq!(attribute.timestamp(), Some(explicit));
    }

    #[test]
    fn stale_explicit_timestamp_falls_back_to_system_time() {
        let mut attribute = Attribute::new("temp", ValueType::Number);
        attribute.set_value_at(json!(1.0), 5_000);
        attribute.set_value_at(json!(2.0), 4_000);
        assert!(attribute.raw_timestamp() < 0);
        assert_eq!(attribute.value(), &json!(2.0));
    }

    #[test]
    fn meta_names_stay_unique() {
        let mut meta = MetaList::new();
        meta.add_or_replace("label", json!("a"));
        let previous = meta.add_or_replace("label", json!("b"));
        assert_eq!(previous, Some(json!("a")));
        assert_eq!(meta.len(), 1);
    }

    #[test]
    fn added_or_modified_ignores_value_changes() {
        let link = AgentLink::new("agent-x");
        let old: AttributeList = vec![
            Attribute::new("a", ValueType::Number).with_agent_link(&link),
            Attribute::new("b", ValueType::Number),
        ]
        .into();
        let mut new = old.clone();
        if let Some(a) = new.get_mut("a") {
            a.set_value(json!(5));
        }
        new.add_or_replace(Attribute::new("c", ValueType::Text));

        let changed: Vec<&str> = new.added_or_modified(&old).map(Attribute::name).collect();
        assert_eq!(changed, vec!["c"]);
    }

    #[test]
    fn attribute_list_serializes_as_array() {
        let list: AttributeList = vec![Attribute::new("x", ValueType::Boolean)].into();
        let encoded = serde_json::to_value(&list).unwrap();
        assert_eq!(encoded[0]["name"], json!("x"));
        assert_eq!(encoded[0]["type"], json!("boolean"));
        let decoded: AttributeList = serde_json::from_value(encoded).unwrap();
        assert!(decoded.contains("x"));
    }
}
