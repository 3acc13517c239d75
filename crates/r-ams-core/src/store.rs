//! ---
//! ams_section: "05-linking-core"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Agent linking and update routing."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
//! Asset storage with a change feed.
//!
//! Structural writes (`merge`, `delete`) emit [`PersistenceEvent`]s to registered
//! listeners once the write is visible. Attribute value writes go through
//! [`AssetStore::update_value`] and emit nothing.

use std::sync::Weak;

use indexmap::IndexMap;
use parking_lot::RwLock;
use r_ams_model::{Asset, AssetQuery, AttributeEvent, PersistenceEvent};
use tracing::{debug, trace};

use crate::error::StoreError;

/// Receives change events from an [`AssetStore`].
pub trait PersistenceListener: Send + Sync {
    fn on_persistence_event(&self, event: &PersistenceEvent);
}

pub trait AssetStore: Send + Sync {
    fn find(&self, asset_id: &str) -> Option<Asset>;

    fn find_all(&self, query: &AssetQuery) -> Vec<Asset>;

    /// Insert or replace an asset. The path is recomputed from the parent.
    fn merge(&self, asset: Asset) -> Result<Asset, StoreError>;

    /// Delete the given assets together with their descendants.
    ///
    /// Returns `false` when any of the ids did not exist.
    fn delete(&self, asset_ids: &[String]) -> Result<bool, StoreError>;

    /// Store a new attribute value without emitting a change event.
    fn update_value(&self, event: &AttributeEvent) -> Result<(), StoreError>;

    fn add_listener(&self, listener: Weak<dyn PersistenceListener>);
}

#[derive(Default)]
pub struct InMemoryAssetStore {
    assets: RwLock<IndexMap<String, Asset>>,
    listeners: RwLock<Vec<Weak<dyn PersistenceListener>>>,
}

impl InMemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.assets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.read().is_empty()
    }

    fn publish(&self, events: Vec<PersistenceEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<_> = {
            let mut guard = self.listeners.write();
            guard.retain(|listener| listener.strong_count() > 0);
            guard.iter().filter_map(Weak::upgrade).collect()
        };
        for event in &events {
            trace!(asset_id = %event.entity.id, cause = ?event.cause, "dispatching persistence event");
            for listener in &listeners {
                listener.on_persistence_event(event);
            }
        }
    }
}

fn resolve_path(
    assets: &IndexMap<String, Asset>,
    asset: &Asset,
) -> Result<Vec<String>, StoreError> {
    let Some(parent_id) = &asset.parent_id else {
        return Ok(vec![asset.id.clone()]);
    };
    let parent = assets
        .get(parent_id)
        .ok_or_else(|| StoreError::ParentNotFound {
            asset_id: asset.id.clone(),
            parent_id: parent_id.clone(),
        })?;
    if parent.path.contains(&asset.id) {
        return Err(StoreError::Cycle {
            asset_id: asset.id.clone(),
        });
    }
    let mut path = Vec::with_capacity(parent.path.len() + 1);
    path.push(asset.id.clone());
    path.extend(parent.path.iter().cloned());
    Ok(path)
}

impl AssetStore for InMemoryAssetStore {
    fn find(&self, asset_id: &str) -> Option<Asset> {
        self.assets.read().get(asset_id).cloned()
    }

    fn find_all(&self, query: &AssetQuery) -> Vec<Asset> {
        self.assets
            .read()
            .values()
            .filter(|asset| query.matches(asset))
            .cloned()
            .collect()
    }

    fn merge(&self, mut asset: Asset) -> Result<Asset, StoreError> {
        let event = {
            let mut assets = self.assets.write();
            asset.path = resolve_path(&assets, &asset)?;

            if let Some(previous) = assets.get(&asset.id).cloned() {
                if previous.path != asset.path {
                    // Re-root descendants onto the new path.
                    let old_len = previous.path.len();
                    for other in assets.values_mut() {
                        if other.id != asset.id && other.path.contains(&asset.id) {
                            let keep = other.path.len() - old_len;
                            other.path.truncate(keep);
                            other.path.extend(asset.path.iter().cloned());
                        }
                    }
                }
                assets.insert(asset.id.clone(), asset.clone());
                PersistenceEvent::updated(previous, asset.clone())
            } else {
                assets.insert(asset.id.clone(), asset.clone());
                PersistenceEvent::created(asset.clone())
            }
        };
        debug!(asset_id = %asset.id, cause = ?event.cause, "asset merged");
        self.publish(vec![event]);
        Ok(asset)
    }

    fn delete(&self, asset_ids: &[String]) -> Result<bool, StoreError> {
        let (events, all_found) = {
            let mut assets = self.assets.write();
            let all_found = asset_ids.iter().all(|id| assets.contains_key(id));
            let mut doomed: Vec<Asset> = assets
                .values()
                .filter(|asset| asset_ids.iter().any(|id| asset.path.contains(id)))
                .cloned()
                .collect();
            // Children before parents.
            doomed.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
            for asset in &doomed {
                assets.shift_remove(&asset.id);
            }
            let events: Vec<_> = doomed.into_iter().map(PersistenceEvent::deleted).collect();
            (events, all_found)
        };
        debug!(requested = asset_ids.len(), removed = events.len(), "assets deleted");
        self.publish(events);
        Ok(all_found)
    }

    fn update_value(&self, event: &AttributeEvent) -> Result<(), StoreError> {
        let mut assets = self.assets.write();
        let asset = assets
            .get_mut(event.asset_id())
            .ok_or_else(|| StoreError::NotFound(event.asset_id().to_owned()))?;
        let attribute = asset
            .attribute_mut(event.name())
            .ok_or_else(|| StoreError::UnknownAttribute(event.reference().clone()))?;
        attribute.set_value_at(event.value().clone(), event.timestamp);
        trace!(attribute = %event.reference(), "attribute value stored");
        Ok(())
    }

    fn add_listener(&self, listener: Weak<dyn PersistenceListener>) {
        self.listeners.write().push(listener);
    }
}
