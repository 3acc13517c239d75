//! ---
//! ams_section: "01-core-functionality"
//! ams_subsection: "binary"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Binary entrypoint for the R-AMS daemon."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use r_ams_core::AssetStore;
use r_ams_model::Asset;
use serde::Deserialize;
use tracing::{debug, info};

/// Assets listed parent first, so every parent exists before its children.
#[derive(Debug, Default, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub assets: Vec<Asset>,
}

impl SeedFile {
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read seed file {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse seed file {}", path.display()))
    }

    /// Merge every asset into `store`, returning how many were written.
    pub fn apply(self, store: &dyn AssetStore) -> Result<usize> {
        let total = self.assets.len();
        for asset in self.assets {
            let id = asset.id.clone();
            store
                .merge(asset)
                .with_context(|| format!("failed to seed asset {id}"))?;
            debug!(asset_id = %id, "seeded asset");
        }
        info!(assets = total, "asset seed applied");
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_ams_core::InMemoryAssetStore;
    use std::io::Write;

    const SEED: &str = r#"
assets:
  - id: agent-1
    name: Mock agent
    type: MockAgent
    attributes:
      - name: disabled
        type: boolean
        value: false
  - id: pump
    name: Pump
    type: ThingAsset
    parentId: agent-1
    attributes:
      - name: level
        type: integer
        meta:
          agentLink:
            id: agent-1
"#;

    #[test]
    fn seeds_assets_in_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SEED.as_bytes()).unwrap();

        let seed = SeedFile::from_path(file.path()).unwrap();
        assert_eq!(seed.assets.len(), 2);

        let store = InMemoryAssetStore::new();
        assert_eq!(seed.apply(&store).unwrap(), 2);
        let pump = store.find("pump").unwrap();
        assert_eq!(pump.path, vec!["pump".to_owned(), "agent-1".to_owned()]);
        assert!(pump.attribute("level").unwrap().has_agent_link());
    }

    #[test]
    fn children_before_parents_fail() {
        let seed: SeedFile = serde_yaml::from_str(
            "assets:\n  - {id: child, name: c, type: ThingAsset, parentId: missing}\n",
        )
        .unwrap();
        assert!(seed.apply(&InMemoryAssetStore::new()).is_err());
    }
}
