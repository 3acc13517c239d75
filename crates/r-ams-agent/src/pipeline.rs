//! ---
//! ams_section: "04-agent-protocols"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Protocol contract and value processing for agents."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
//! Value processing between protocol wire values and linked attribute values.
//!
//! Every function here is pure apart from logging. Failures never escape: a value that
//! cannot be coerced is dropped, a write template that cannot be parsed leaves the value
//! as it was. An execution request with an unparseable template is sent as null.

use r_ams_common::Clock;
use r_ams_model::agent_link::{DYNAMIC_VALUE_PLACEHOLDER, NULL_LITERAL};
use r_ams_model::filter::apply_filters;
use r_ams_model::value::value_to_string;
use r_ams_model::{
    AgentLink, Attribute, AttributeRef, AttributeState, ExecutionStatus, Value, ValueFilter,
    ValuePredicate, ValueType,
};
use serde_json::Map;
use tracing::{debug, trace, warn};

const CONVERTER_IGNORE: &str = "@IGNORE";
const CONVERTER_NULL: &str = "@NULL";

/// Result of running a value through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueOutcome {
    /// Drop the update entirely.
    pub ignore: bool,
    pub value: Value,
}

impl ValueOutcome {
    pub fn keep(value: Value) -> Self {
        Self {
            ignore: false,
            value,
        }
    }

    pub fn ignored(value: Value) -> Self {
        Self {
            ignore: true,
            value,
        }
    }
}

/// Linked attribute write to value sent to the protocol.
///
/// `dynamic_write` is whether the link's write value template contains the dynamic
/// placeholder; it is computed once when the attribute is linked.
pub fn process_outbound(
    asset_id: &str,
    attribute: &Attribute,
    link: &AgentLink,
    value: Value,
    dynamic_write: bool,
) -> ValueOutcome {
    let write_value = link.write_value.as_deref().filter(|t| !t.is_empty());

    if attribute.value_type().base() == ValueType::ExecutionStatus
        && ExecutionStatus::from_value(&value) == Some(ExecutionStatus::RequestStart)
    {
        if let Some(template) = write_value {
            trace!(asset_id, attribute = attribute.name(), "execution request uses write value");
            let payload = match serde_json::from_str(template) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(
                        asset_id,
                        attribute = attribute.name(),
                        error = %err,
                        "execution write value is not valid JSON; sending null"
                    );
                    Value::Null
                }
            };
            return ValueOutcome::keep(payload);
        }
    }

    let mut value = value;
    if let Some(converter) = &link.write_value_converter {
        debug!(asset_id, attribute = attribute.name(), "applying write value converter");
        let outcome = apply_value_converter(value, converter);
        if outcome.ignore {
            return outcome;
        }
        value = outcome.value;
    }

    if value.is_null() {
        return ValueOutcome::keep(Value::Null);
    }

    if let Some(template) = write_value {
        let rendered = if dynamic_write {
            template.replace(DYNAMIC_VALUE_PLACEHOLDER, &value_to_string(&value))
        } else {
            template.to_owned()
        };
        match serde_json::from_str::<Value>(&rendered) {
            Ok(parsed) => value = parsed,
            Err(err) => {
                debug!(
                    asset_id,
                    attribute = attribute.name(),
                    error = %err,
                    "write value payload is not valid JSON; keeping value"
                );
            }
        }
    }

    ValueOutcome::keep(value)
}

/// Protocol value to linked attribute value.
pub fn process_inbound(
    asset_id: &str,
    attribute: &Attribute,
    link: &AgentLink,
    value: Value,
) -> ValueOutcome {
    let mut value = value;

    if let Some(filters) = &link.value_filters {
        value = apply_filters(value, filters);
        if value.is_null() {
            debug!(asset_id, attribute = attribute.name(), "value filters produced null");
        }
    }

    if let Some(converter) = &link.value_converter {
        debug!(asset_id, attribute = attribute.name(), "applying value converter");
        let outcome = apply_value_converter(value, converter);
        if outcome.ignore {
            return outcome;
        }
        value = outcome.value;
    }

    if value.is_null() {
        return ValueOutcome::keep(Value::Null);
    }

    let target = attribute.value_type().base();
    if target.accepts(&value) {
        return ValueOutcome::keep(value);
    }
    match target.coerce(value) {
        Ok(coerced) => {
            trace!(asset_id, attribute = attribute.name(), %target, "applied built in coercion");
            ValueOutcome::keep(coerced)
        }
        Err(err) => {
            warn!(
                asset_id,
                attribute = attribute.name(),
                error = %err,
                "dropping inbound value that cannot be coerced"
            );
            ValueOutcome::ignored(Value::Null)
        }
    }
}

/// Look up the upper-cased string form of `value` in `converter`.
///
/// A missing key drops the value: once a converter is configured only mapped values
/// pass through.
pub fn apply_value_converter(value: Value, converter: &Map<String, Value>) -> ValueOutcome {
    let key = match &value {
        Value::Null => NULL_LITERAL.to_uppercase(),
        other => value_to_string(other).to_uppercase(),
    };
    match converter.get(&key) {
        Some(Value::String(s)) if s.eq_ignore_ascii_case(CONVERTER_IGNORE) => {
            ValueOutcome::ignored(Value::Null)
        }
        Some(Value::String(s)) if s.eq_ignore_ascii_case(CONVERTER_NULL) => {
            ValueOutcome::keep(Value::Null)
        }
        Some(mapped) => ValueOutcome::keep(mapped.clone()),
        None => ValueOutcome::ignored(value),
    }
}

/// Matches raw text messages against a link's message predicate.
#[derive(Debug, Clone)]
pub struct MessageMatcher {
    reference: AttributeRef,
    predicate: ValuePredicate,
    filters: Vec<ValueFilter>,
}

impl MessageMatcher {
    /// `None` when the link has no message match predicate.
    pub fn for_link(reference: AttributeRef, link: &AgentLink) -> Option<Self> {
        let predicate = link.message_match_predicate.clone()?;
        Some(Self {
            reference,
            predicate,
            filters: link.message_match_filters.clone().unwrap_or_default(),
        })
    }

    pub fn reference(&self) -> &AttributeRef {
        &self.reference
    }

    /// State update carrying the unfiltered message when the message matches.
    pub fn handle(&self, message: &str, clock: &dyn Clock) -> Option<AttributeState> {
        if message.is_empty() {
            return None;
        }
        let filtered = apply_filters(Value::String(message.to_owned()), &self.filters);
        if filtered.is_null() || !self.predicate.test(&filtered, clock) {
            return None;
        }
        trace!(attribute = %self.reference, "message matched attribute link");
        Some(AttributeState::new(
            self.reference.clone(),
            Value::String(message.to_owned()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_ams_common::FixedClock;
    use r_ams_model::StringPredicate;
    use serde_json::json;

    fn converter(entries: Value) -> Map<String, Value> {
        entries.as_object().cloned().unwrap_or_default()
    }

    fn text_attribute() -> Attribute {
        Attribute::new("status", ValueType::Text)
    }

    #[test]
    fn outbound_converter_null_ignore_and_absent() {
        let attribute = text_attribute();
        let to_null = AgentLink::new("a").with_write_value_converter(converter(json!({"ACTIVE": "@NULL"})));
        assert_eq!(
            process_outbound("x", &attribute, &to_null, json!("ACTIVE"), false),
            ValueOutcome::keep(Value::Null)
        );

        let to_ignore =
            AgentLink::new("a").with_write_value_converter(converter(json!({"ACTIVE": "@IGNORE"})));
        assert_eq!(
            process_outbound("x", &attribute, &to_ignore, json!("ACTIVE"), false),
            ValueOutcome::ignored(Value::Null)
        );

        let empty = AgentLink::new("a").with_write_value_converter(Map::new());
        assert_eq!(
            process_outbound("x", &attribute, &empty, json!("ACTIVE"), false),
            ValueOutcome::ignored(json!("ACTIVE"))
        );
    }

    #[test]
    fn outbound_dynamic_placeholder_is_substituted() {
        let link = AgentLink::new("a").with_write_value("{\"cmd\":\"$value\"}");
        let outcome = process_outbound(
            "x",
            &Attribute::new("level", ValueType::Integer),
            &link,
            json!(42),
            link.has_dynamic_write_value(),
        );
        assert_eq!(outcome, ValueOutcome::keep(json!({"cmd": "42"})));
    }

    #[test]
    fn outbound_converted_value_feeds_template() {
        let link = AgentLink::new("a")
            .with_write_value_converter(converter(json!({"ON": 1})))
            .with_write_value("[$value]");
        let outcome = process_outbound("x", &text_attribute(), &link, json!("on"), true);
        assert_eq!(outcome, ValueOutcome::keep(json!([1])));
    }

    #[test]
    fn outbound_unparseable_template_keeps_value() {
        let link = AgentLink::new("a").with_write_value("not json $value");
        let outcome = process_outbound("x", &text_attribute(), &link, json!("v"), true);
        assert_eq!(outcome, ValueOutcome::keep(json!("v")));
    }

    #[test]
    fn outbound_execution_request_uses_template_verbatim() {
        let link = AgentLink::new("a")
            .with_write_value("{\"run\":true}")
            .with_write_value_converter(Map::new());
        let attribute = Attribute::new("exec", ValueType::ExecutionStatus);
        let outcome = process_outbound("x", &attribute, &link, json!("REQUEST_START"), false);
        assert_eq!(outcome, ValueOutcome::keep(json!({"run": true})));
    }

    #[test]
    fn outbound_execution_request_with_invalid_template_sends_null() {
        let link = AgentLink::new("a").with_write_value("start now");
        let attribute = Attribute::new("exec", ValueType::ExecutionStatus);
        let outcome = process_outbound("x", &attribute, &link, json!("REQUEST_START"), false);
        assert_eq!(outcome, ValueOutcome::keep(Value::Null));
    }

    #[test]
    fn inbound_integer_to_boolean_is_dropped() {
        let attribute = Attribute::new("switch", ValueType::Boolean);
        let outcome = process_inbound("x", &attribute, &AgentLink::new("a"), json!(123));
        assert_eq!(outcome, ValueOutcome::ignored(Value::Null));
    }

    #[test]
    fn inbound_null_from_filters_still_reaches_converter() {
        let link = AgentLink::new("a")
            .with_value_filters(vec![ValueFilter::JsonPointer {
                pointer: "/missing".into(),
            }])
            .with_value_converter(converter(json!({"NULL": "off"})));
        let outcome = process_inbound("x", &text_attribute(), &link, json!({"present": 1}));
        assert_eq!(outcome, ValueOutcome::keep(json!("off")));
    }

    #[test]
    fn inbound_coerces_numeric_strings() {
        let attribute = Attribute::new("temp", ValueType::Number);
        let outcome = process_inbound("x", &attribute, &AgentLink::new("a"), json!("21.5"));
        assert_eq!(outcome, ValueOutcome::keep(json!(21.5)));
    }

    #[test]
    fn message_matcher_emits_original_message() {
        let link = AgentLink::new("a").with_message_match(
            ValuePredicate::String(StringPredicate::exact("OK")),
            Some(vec![ValueFilter::Substring {
                begin_index: 0,
                end_index: Some(2),
            }]),
        );
        let matcher = MessageMatcher::for_link(AttributeRef::new("x", "status"), &link).unwrap();
        let clock = FixedClock::new(0);
        let state = matcher.handle("OK:ready", &clock).unwrap();
        assert_eq!(state.value, json!("OK:ready"));
        assert!(matcher.handle("", &clock).is_none());
        assert!(matcher.handle("NO:ready", &clock).is_none());
    }

    #[test]
    fn matcher_requires_predicate() {
        assert!(MessageMatcher::for_link(AttributeRef::new("x", "y"), &AgentLink::new("a")).is_none());
    }
}
