//! ---
//! ams_section: "02-asset-model"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Typed asset and attribute model."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::value::{value_to_string, Value};

/// Transformation applied to a raw protocol value. A filter yields `Value::Null` when
/// it cannot produce a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ValueFilter {
    /// Extract a capture group from the `match_index`-th match of `pattern`.
    #[serde(rename_all = "camelCase")]
    Regex {
        pattern: String,
        #[serde(default)]
        match_group: Option<usize>,
        #[serde(default)]
        match_index: Option<usize>,
    },
    /// Character range of the string form of the value.
    #[serde(rename_all = "camelCase")]
    Substring {
        begin_index: usize,
        #[serde(default)]
        end_index: Option<usize>,
    },
    /// RFC 6901 pointer into a JSON value (strings are parsed first).
    #[serde(rename_all = "camelCase")]
    JsonPointer { pointer: String },
}

impl ValueFilter {
    pub fn apply(&self, value: &Value) -> Value {
        if value.is_null() {
            return Value::Null;
        }
        match self {
            ValueFilter::Regex {
                pattern,
                match_group,
                match_index,
            } => {
                let regex = match Regex::new(pattern) {
                    Ok(regex) => regex,
                    Err(err) => {
                        warn!(pattern = %pattern, error = %err, "invalid regex filter pattern");
                        return Value::Null;
                    }
                };
                let text = value_to_string(value);
                let matched = regex
                    .captures_iter(&text)
                    .nth(match_index.unwrap_or(0))
                    .and_then(|captures| captures.get(match_group.unwrap_or(0)))
                    .map(|m| Value::String(m.as_str().to_owned()))
                    .unwrap_or(Value::Null);
                matched
            }
            ValueFilter::Substring {
                begin_index,
                end_index,
            } => {
                let text = value_to_string(value);
                let len = text.chars().count();
                let end = end_index.unwrap_or(len).min(len);
                if *begin_index > end {
                    return Value::Null;
                }
                Value::String(
                    text.chars()
                        .skip(*begin_index)
                        .take(end - begin_index)
                        .collect(),
                )
            }
            ValueFilter::JsonPointer { pointer } => {
                let parsed;
                let target = match value {
                    Value::String(s) => match serde_json::from_str::<Value>(s) {
                        Ok(inner) => {
                            parsed = inner;
                            &parsed
                        }
                        Err(_) => return Value::Null,
                    },
                    other => other,
                };
                target.pointer(pointer).cloned().unwrap_or(Value::Null)
            }
        }
    }
}

/// Apply `filters` in order; a null intermediate result ends the chain.
pub fn apply_filters(value: Value, filters: &[ValueFilter]) -> Value {
    let mut current = value;
    for filter in filters {
        current = filter.apply(&current);
        if current.is_null() {
            debug!(?filter, "value filter produced null");
            break;
        }
    }
    current
}
