//! ---
//! ams_section: "05-linking-core"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Agent linking and update routing."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
use std::collections::HashSet;

use parking_lot::RwLock;
use r_ams_model::Asset;

/// Tells the linking service which assets are mirrored from a downstream gateway.
///
/// Gateway-owned agents and attributes are handled by the gateway itself and are
/// skipped locally.
pub trait GatewayRegistry: Send + Sync {
    fn is_gateway_owned(&self, asset: &Asset) -> bool;
}

/// Registry backed by a fixed set of gateway asset ids.
///
/// An asset is gateway owned when a registered gateway appears among its ancestors.
#[derive(Debug, Default)]
pub struct StaticGatewayRegistry {
    gateways: RwLock<HashSet<String>>,
}

impl StaticGatewayRegistry {
    pub fn new<I, S>(gateway_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            gateways: RwLock::new(gateway_ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn register(&self, gateway_id: impl Into<String>) {
        self.gateways.write().insert(gateway_id.into());
    }

    pub fn deregister(&self, gateway_id: &str) -> bool {
        self.gateways.write().remove(gateway_id)
    }
}

impl GatewayRegistry for StaticGatewayRegistry {
    fn is_gateway_owned(&self, asset: &Asset) -> bool {
        let gateways = self.gateways.read();
        !gateways.is_empty() && asset.ancestors().any(|id| gateways.contains(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_ams_model::asset::GATEWAY_ASSET_TYPE;

    #[test]
    fn descendants_of_gateways_are_owned() {
        let registry = StaticGatewayRegistry::default();
        let mut child = Asset::new("pump", "Thing").with_id("pump").with_parent("gw");
        child.path = vec!["pump".into(), "gw".into()];
        let gateway = Asset::new("gw", GATEWAY_ASSET_TYPE).with_id("gw");

        assert!(!registry.is_gateway_owned(&child));
        registry.register("gw");
        assert!(registry.is_gateway_owned(&child));
        assert!(!registry.is_gateway_owned(&gateway));
        assert!(registry.deregister("gw"));
        assert!(!registry.is_gateway_owned(&child));
    }
}
