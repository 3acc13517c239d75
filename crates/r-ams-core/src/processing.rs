//! ---
//! ams_section: "05-linking-core"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Agent linking and update routing."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
use std::sync::Arc;

use r_ams_model::{AttributeEvent, Source};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{CoreError, StoreError};
use crate::service::AgentService;
use crate::store::AssetStore;

/// What happened to an attribute write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Forwarded to an agent; the stored value changes when the device reports back.
    Consumed,
    Persisted,
}

/// Entry point for attribute writes from clients, rules and protocols.
pub struct AssetProcessor {
    store: Arc<dyn AssetStore>,
    agents: Arc<AgentService>,
}

impl AssetProcessor {
    pub fn new(store: Arc<dyn AssetStore>, agents: Arc<AgentService>) -> Self {
        Self { store, agents }
    }

    pub fn write_attribute(
        &self,
        event: AttributeEvent,
        source: Source,
    ) -> Result<WriteOutcome, CoreError> {
        let asset = self
            .store
            .find(event.asset_id())
            .ok_or_else(|| StoreError::NotFound(event.asset_id().to_owned()))?;
        if asset.attribute(event.name()).is_none() {
            return Err(StoreError::UnknownAttribute(event.reference().clone()).into());
        }
        if self.agents.process_asset_update(&asset, &event, source) {
            return Ok(WriteOutcome::Consumed);
        }
        self.store.update_value(&event)?;
        trace!(attribute = %event.reference(), ?source, "attribute write persisted");
        Ok(WriteOutcome::Persisted)
    }

    /// Persist sensor updates published by protocol instances.
    pub fn spawn_sensor_consumer(
        self: &Arc<Self>,
        mut sensor: UnboundedReceiver<AttributeEvent>,
    ) -> JoinHandle<()> {
        let processor = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = sensor.recv().await {
                let reference = event.reference().clone();
                if let Err(err) = processor.write_attribute(event, Source::Sensor) {
                    warn!(attribute = %reference, error = %err, "dropping sensor update");
                }
            }
            debug!("sensor consumer stopped");
        })
    }
}
