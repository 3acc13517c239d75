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

use crate::agent_link::AGENT_LINK;
use crate::asset::Asset;
use crate::attribute::Attribute;
use crate::predicate::StringPredicate;

/// Matches attributes carrying meta item `name`, optionally testing the value found at
/// JSON pointer `path` inside that item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaPredicate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<StringPredicate>,
}

impl MetaPredicate {
    pub fn matches(&self, attribute: &Attribute) -> bool {
        let Some(item) = attribute.meta().get(&self.name) else {
            return false;
        };
        let target = match &self.path {
            Some(pointer) => match item.pointer(pointer) {
                Some(value) => value,
                None => return false,
            },
            None => item,
        };
        self.value
            .as_ref()
            .map_or(true, |predicate| predicate.test(target))
    }
}

/// Criteria for selecting assets from the store. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetQuery {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub parents: Vec<String>,
    /// Asset must have all of these ids somewhere in its path.
    #[serde(default)]
    pub paths: Vec<String>,
    /// At least one attribute must satisfy every meta predicate.
    #[serde(default)]
    pub attribute_meta: Vec<MetaPredicate>,
}

impl AssetQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parents = parents.into_iter().map(Into::into).collect();
        self
    }

    pub fn under(mut self, ancestor: impl Into<String>) -> Self {
        self.paths.push(ancestor.into());
        self
    }

    pub fn attribute_meta(mut self, predicate: MetaPredicate) -> Self {
        self.attribute_meta.push(predicate);
        self
    }

    /// Assets with at least one attribute whose agent link references `agent_id`.
    pub fn linked_to_agent(agent_id: &str) -> Self {
        Self::new().attribute_meta(MetaPredicate {
            name: AGENT_LINK.to_owned(),
            path: Some("/id".to_owned()),
            value: Some(StringPredicate::exact(agent_id)),
        })
    }

    pub fn matches(&self, asset: &Asset) -> bool {
        if !self.ids.is_empty() && !self.ids.contains(&asset.id) {
            return false;
        }
        if !self.types.is_empty() && !self.types.contains(&asset.asset_type) {
            return false;
        }
        if !self.parents.is_empty()
            && !asset
                .parent_id
                .as_ref()
                .is_some_and(|parent| self.parents.contains(parent))
        {
            return false;
        }
        if !self.paths.iter().all(|id| asset.path.contains(id)) {
            return false;
        }
        self.attribute_meta.is_empty()
            || asset.attributes.iter().any(|attribute| {
                self.attribute_meta
                    .iter()
                    .all(|predicate| predicate.matches(attribute))
            })
    }
}
