//! ---
//! ams_section: "02-asset-model"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Typed asset and attribute model."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
//! Value types and the value-descriptor registry.
//!
//! Attribute values travel as [`serde_json::Value`]; `Value::Null` means "no value".
//! A [`ValueDescriptor`] names the declared type of an attribute and resolves to one
//! of the base [`ValueType`]s, which decide the native representation and the
//! coercion rules applied to inbound protocol values.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

use crate::agent::{ConnectionStatus, ExecutionStatus};
use crate::error::{ModelError, Result};

pub type Value = serde_json::Value;

/// Base value types understood by the runtime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr, EnumIter,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ValueType {
    Boolean,
    Integer,
    Number,
    Text,
    Json,
    ExecutionStatus,
    ConnectionStatus,
}

/// Runtime shape of a JSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeKind {
    Bool,
    Integer,
    Number,
    String,
    Any,
}

impl NativeKind {
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(NativeKind::Bool),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(NativeKind::Integer),
            Value::Number(_) => Some(NativeKind::Number),
            Value::String(_) => Some(NativeKind::String),
            Value::Array(_) | Value::Object(_) => Some(NativeKind::Any),
        }
    }
}

impl ValueType {
    pub fn native(self) -> NativeKind {
        match self {
            ValueType::Boolean => NativeKind::Bool,
            ValueType::Integer => NativeKind::Integer,
            ValueType::Number => NativeKind::Number,
            ValueType::Text | ValueType::ExecutionStatus | ValueType::ConnectionStatus => {
                NativeKind::String
            }
            ValueType::Json => NativeKind::Any,
        }
    }

    /// Whether `value` already has this type's native representation.
    pub fn accepts(self, value: &Value) -> bool {
        match (self.native(), NativeKind::of(value)) {
            (_, None) | (NativeKind::Any, _) => true,
            (NativeKind::Number, Some(NativeKind::Integer)) => true,
            (expected, Some(actual)) if expected != actual => false,
            _ => match self {
                ValueType::ExecutionStatus => value
                    .as_str()
                    .is_some_and(|s| ExecutionStatus::from_str(s).is_ok()),
                ValueType::ConnectionStatus => value
                    .as_str()
                    .is_some_and(|s| ConnectionStatus::from_str(s).is_ok()),
                _ => true,
            },
        }
    }

    /// Convert `value` into this type's native representation.
    pub fn coerce(self, value: Value) -> Result<Value> {
        if self.accepts(&value) {
            return Ok(value);
        }
        let failed = |value: &Value| ModelError::Coercion {
            expected: self,
            value: value.to_string(),
        };
        let coerced = match (self, &value) {
            (ValueType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str()
            {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            (ValueType::Integer, Value::Number(n)) => n
                .as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| Value::from(f as i64)),
            (ValueType::Integer, Value::String(s)) => {
                s.trim().parse::<i64>().ok().map(Value::from)
            }
            (ValueType::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            (ValueType::Text, Value::Bool(_) | Value::Number(_)) => {
                Some(Value::String(value.to_string()))
            }
            (ValueType::ExecutionStatus, Value::String(s)) => {
                ExecutionStatus::from_str(&s.to_ascii_uppercase())
                    .ok()
                    .map(|status| Value::String(status.to_string()))
            }
            (ValueType::ConnectionStatus, Value::String(s)) => {
                ConnectionStatus::from_str(&s.to_ascii_uppercase())
                    .ok()
                    .map(|status| Value::String(status.to_string()))
            }
            _ => None,
        };
        coerced.ok_or_else(|| failed(&value))
    }
}

static DESCRIPTORS: Lazy<RwLock<HashMap<String, ValueType>>> = Lazy::new(|| {
    let mut map: HashMap<String, ValueType> = ValueType::iter()
        .map(|base| (base.to_string(), base))
        .collect();
    for (name, base) in [
        ("positiveInteger", ValueType::Integer),
        ("positiveNumber", ValueType::Number),
        ("percentage", ValueType::Number),
        ("timestamp", ValueType::Integer),
        ("jsonObject", ValueType::Json),
        ("jsonArray", ValueType::Json),
    ] {
        map.insert(name.to_owned(), base);
    }
    RwLock::new(map)
});

/// Declared type of an attribute: a registered descriptor name plus its base type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValueDescriptor {
    name: String,
    base: ValueType,
}

impl ValueDescriptor {
    /// Look up a descriptor by name; unregistered names resolve to [`ValueType::Json`].
    pub fn resolve(name: &str) -> Self {
        let base = DESCRIPTORS
            .read()
            .get(name)
            .copied()
            .unwrap_or(ValueType::Json);
        Self {
            name: name.to_owned(),
            base,
        }
    }

    /// Register an additional named descriptor derived from `base`.
    pub fn register(name: impl Into<String>, base: ValueType) -> Self {
        let name = name.into();
        DESCRIPTORS.write().insert(name.clone(), base);
        Self { name, base }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> ValueType {
        self.base
    }
}

impl From<ValueType> for ValueDescriptor {
    fn from(base: ValueType) -> Self {
        Self {
            name: base.to_string(),
            base,
        }
    }
}

impl fmt::Display for ValueDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Serialize for ValueDescriptor {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

impl<'de> Deserialize<'de> for ValueDescriptor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(ValueDescriptor::resolve(&name))
    }
}

/// String form used by converters and placeholder substitution; strings are unquoted.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integer_to_boolean_is_rejected() {
        assert!(ValueType::Boolean.coerce(json!(123)).is_err());
    }

    #[test]
    fn textual_booleans_and_numbers_coerce() {
        assert_eq!(ValueType::Boolean.coerce(json!("TRUE")).unwrap(), json!(true));
        assert_eq!(ValueType::Integer.coerce(json!("42")).unwrap(), json!(42));
        assert_eq!(ValueType::Integer.coerce(json!(7.0)).unwrap(), json!(7));
        assert!(ValueType::Integer.coerce(json!(7.5)).is_err());
        assert_eq!(ValueType::Number.coerce(json!("1.5")).unwrap(), json!(1.5));
        assert_eq!(ValueType::Text.coerce(json!(12)).unwrap(), json!("12"));
    }

    #[test]
    fn status_types_accept_known_names_only() {
        assert!(ValueType::ConnectionStatus.accepts(&json!("CONNECTED")));
        assert_eq!(
            ValueType::ExecutionStatus.coerce(json!("request_start")).unwrap(),
            json!("REQUEST_START")
        );
        assert!(ValueType::ConnectionStatus.coerce(json!("SLEEPY")).is_err());
    }

    #[test]
    fn descriptors_resolve_through_registry() {
        assert_eq!(ValueDescriptor::resolve("positiveInteger").base(), ValueType::Integer);
        assert_eq!(ValueDescriptor::resolve("somethingElse").base(), ValueType::Json);
        ValueDescriptor::register("temperature", ValueType::Number);
        let parsed: ValueDescriptor = serde_json::from_value(json!("temperature")).unwrap();
        assert_eq!(parsed.base(), ValueType::Number);
        assert_eq!(serde_json::to_value(&parsed).unwrap(), json!("temperature"));
    }
}
