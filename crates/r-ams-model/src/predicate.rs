//! ---
//! ams_section: "02-asset-model"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Typed asset and attribute model."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
use chrono::DateTime;
use r_ams_common::Clock;
use serde::{Deserialize, Serialize};

use crate::value::{value_to_string, Value};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StringMatch {
    #[default]
    Exact,
    Begin,
    End,
    Contains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StringPredicate {
    #[serde(rename = "match", default)]
    pub match_type: StringMatch,
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
    #[serde(default)]
    pub negate: bool,
    pub value: String,
}

impl StringPredicate {
    pub fn exact(value: impl Into<String>) -> Self {
        Self {
            match_type: StringMatch::Exact,
            case_sensitive: true,
            negate: false,
            value: value.into(),
        }
    }

    pub fn with_match(mut self, match_type: StringMatch) -> Self {
        self.match_type = match_type;
        self
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_sensitive = false;
        self
    }

    pub fn negated(mut self) -> Self {
        self.negate = true;
        self
    }

    pub fn test_str(&self, candidate: &str) -> bool {
        let (candidate, expected) = if self.case_sensitive {
            (candidate.to_owned(), self.value.clone())
        } else {
            (candidate.to_lowercase(), self.value.to_lowercase())
        };
        let matched = match self.match_type {
            StringMatch::Exact => candidate == expected,
            StringMatch::Begin => candidate.starts_with(&expected),
            StringMatch::End => candidate.ends_with(&expected),
            StringMatch::Contains => candidate.contains(&expected),
        };
        matched != self.negate
    }

    /// Null never matches, negated or not.
    pub fn test(&self, value: &Value) -> bool {
        if value.is_null() {
            return false;
        }
        self.test_str(&value_to_string(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NumberOperator {
    Equals,
    GreaterThan,
    GreaterEquals,
    LessThan,
    LessEquals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DateTimeOperator {
    Before,
    After,
}

/// Condition evaluated against a (possibly filtered) protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "predicateType", rename_all = "camelCase")]
pub enum ValuePredicate {
    String(StringPredicate),
    Boolean {
        value: bool,
    },
    #[serde(rename_all = "camelCase")]
    Number {
        operator: NumberOperator,
        value: f64,
        #[serde(default)]
        negate: bool,
    },
    /// Compares an epoch-millis or RFC 3339 value with `now + offset_millis`.
    #[serde(rename_all = "camelCase")]
    DateTime {
        operator: DateTimeOperator,
        #[serde(default)]
        offset_millis: i64,
    },
}

impl ValuePredicate {
    pub fn test(&self, value: &Value, clock: &dyn Clock) -> bool {
        match self {
            ValuePredicate::String(predicate) => predicate.test(value),
            ValuePredicate::Boolean { value: expected } => match value {
                Value::Bool(actual) => actual == expected,
                Value::String(s) => s.eq_ignore_ascii_case(if *expected { "true" } else { "false" }),
                _ => false,
            },
            ValuePredicate::Number {
                operator,
                value: expected,
                negate,
            } => {
                let actual = match value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                let Some(actual) = actual else {
                    return false;
                };
                let matched = match operator {
                    NumberOperator::Equals => (actual - expected).abs() < f64::EPSILON,
                    NumberOperator::GreaterThan => actual > *expected,
                    NumberOperator::GreaterEquals => actual >= *expected,
                    NumberOperator::LessThan => actual < *expected,
                    NumberOperator::LessEquals => actual <= *expected,
                };
                matched != *negate
            }
            ValuePredicate::DateTime {
                operator,
                offset_millis,
            } => {
                let actual = match value {
                    Value::Number(n) => n.as_i64(),
                    Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
                        .ok()
                        .map(|dt| dt.timestamp_millis()),
                    _ => None,
                };
                let Some(actual) = actual else {
                    return false;
                };
                let reference = clock.now_millis() + offset_millis;
                match operator {
                    DateTimeOperator::Before => actual < reference,
                    DateTimeOperator::After => actual > reference,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_ams_common::FixedClock;
    use serde_json::json;

    #[test]
    fn string_predicate_variants() {
        let predicate = StringPredicate::exact("temp").with_match(StringMatch::Begin);
        assert!(predicate.test(&json!("temperature")));
        assert!(!predicate.clone().negated().test(&json!("temperature")));
        assert!(StringPredicate::exact("ABC").case_insensitive().test(&json!("abc")));
        assert!(!StringPredicate::exact("x").negated().test(&Value::Null));
    }

    #[test]
    fn number_predicate_parses_strings() {
        let predicate: ValuePredicate = serde_json::from_value(json!({
            "predicateType": "number",
            "operator": "greaterThan",
            "value": 10
        }))
        .unwrap();
        let clock = FixedClock::new(0);
        assert!(predicate.test(&json!("12.5"), &clock));
        assert!(!predicate.test(&json!(3), &clock));
    }

    #[test]
    fn date_time_predicate_uses_clock() {
        let clock = FixedClock::new(1_000_000);
        let before = ValuePredicate::DateTime {
            operator: DateTimeOperator::Before,
            offset_millis: 0,
        };
        assert!(before.test(&json!(999_999), &clock));
        clock.advance(std::time::Duration::from_millis(10));
        assert!(before.test(&json!(1_000_005), &clock));
        assert!(!before.test(&json!(2_000_000), &clock));
    }
}
