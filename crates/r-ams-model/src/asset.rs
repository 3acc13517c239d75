//! ---
//! ams_section: "02-asset-model"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Typed asset and attribute model."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentKind;
use crate::attribute::{Attribute, AttributeList};

/// Asset type of a federated gateway root.
pub const GATEWAY_ASSET_TYPE: &str = "GatewayAsset";
/// Asset type used for plain device assets.
pub const THING_ASSET_TYPE: &str = "ThingAsset";

/// A node in the asset hierarchy.
///
/// `path` lists the asset's own id followed by its ancestors up to the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub asset_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default)]
    pub attributes: AttributeList,
}

impl Asset {
    pub fn new(name: impl Into<String>, asset_type: impl Into<String>) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self {
            path: vec![id.clone()],
            id,
            name: name.into(),
            asset_type: asset_type.into(),
            parent_id: None,
            attributes: AttributeList::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self.path = vec![self.id.clone()];
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.add_or_replace(attribute);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    pub fn attribute_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        self.attributes.get_mut(name)
    }

    pub fn is_agent(&self) -> bool {
        AgentKind::from_str(&self.asset_type).is_ok()
    }

    pub fn is_gateway(&self) -> bool {
        self.asset_type == GATEWAY_ASSET_TYPE
    }

    /// Ancestors ordered from the direct parent to the root.
    pub fn ancestors(&self) -> impl Iterator<Item = &str> {
        self.path.iter().skip(1).map(String::as_str)
    }
}

/// Discovered asset together with the children that should be created beneath it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetTreeNode {
    pub asset: Asset,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<AssetTreeNode>,
}

impl AssetTreeNode {
    pub fn new(asset: Asset) -> Self {
        Self {
            asset,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: AssetTreeNode) -> Self {
        self.children.push(child);
        self
    }

    /// Depth-first count of assets in this subtree.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(AssetTreeNode::size).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_asset_path_starts_with_itself() {
        let asset = Asset::new("pump", THING_ASSET_TYPE).with_id("a1");
        assert_eq!(asset.path, vec!["a1".to_owned()]);
        assert_eq!(asset.ancestors().count(), 0);
    }

    #[test]
    fn agent_types_are_recognised() {
        assert!(Asset::new("agent", "MockAgent").is_agent());
        assert!(!Asset::new("thing", THING_ASSET_TYPE).is_agent());
        assert!(Asset::new("gw", GATEWAY_ASSET_TYPE).is_gateway());
    }

    #[test]
    fn tree_node_counts_descendants() {
        let tree = AssetTreeNode::new(Asset::new("root", THING_ASSET_TYPE))
            .with_child(AssetTreeNode::new(Asset::new("a", THING_ASSET_TYPE)))
            .with_child(
                AssetTreeNode::new(Asset::new("b", THING_ASSET_TYPE))
                    .with_child(AssetTreeNode::new(Asset::new("c", THING_ASSET_TYPE))),
            );
        assert_eq!(tree.size(), 4);
    }
}
