//! ---
//! ams_section: "05-linking-core"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Agent linking and update routing."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use r_ams_model::AttributeEvent;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Carries actuator writes to protocol instances and sensor updates back to storage.
pub trait MessageBus: Send + Sync {
    /// Route a write for an attribute linked to `agent_id` to that agent's protocol.
    fn send_actuator(&self, agent_id: &str, event: AttributeEvent) -> Result<(), TransportError>;

    /// Publish a protocol-originated update for persistence.
    fn send_sensor(&self, event: AttributeEvent) -> Result<(), TransportError>;

    /// Human-readable bus name for logging.
    fn name(&self) -> &'static str;
}

/// Actuator write addressed to one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorMessage {
    pub agent_id: String,
    pub event: AttributeEvent,
}

/// In-process bus backed by unbounded tokio channels.
#[derive(Debug, Clone)]
pub struct ChannelBus {
    actuator: mpsc::UnboundedSender<ActuatorMessage>,
    sensor: mpsc::UnboundedSender<AttributeEvent>,
    actuator_depth: Arc<AtomicUsize>,
}

/// Receiving halves of a [`ChannelBus`].
#[derive(Debug)]
pub struct BusReceivers {
    pub actuator: ActuatorQueue,
    pub sensor: mpsc::UnboundedReceiver<AttributeEvent>,
}

/// Actuator receiver that tracks how many messages are waiting.
#[derive(Debug)]
pub struct ActuatorQueue {
    rx: mpsc::UnboundedReceiver<ActuatorMessage>,
    depth: Arc<AtomicUsize>,
}

impl ActuatorQueue {
    pub async fn recv(&mut self) -> Option<ActuatorMessage> {
        let message = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Some(message)
    }

    /// Messages sent but not yet received.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

impl ChannelBus {
    pub fn new() -> (Self, BusReceivers) {
        let (actuator_tx, actuator_rx) = mpsc::unbounded_channel();
        let (sensor_tx, sensor_rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let bus = Self {
            actuator: actuator_tx,
            sensor: sensor_tx,
            actuator_depth: depth.clone(),
        };
        let receivers = BusReceivers {
            actuator: ActuatorQueue {
                rx: actuator_rx,
                depth,
            },
            sensor: sensor_rx,
        };
        (bus, receivers)
    }
}

impl MessageBus for ChannelBus {
    fn send_actuator(&self, agent_id: &str, event: AttributeEvent) -> Result<(), TransportError> {
        self.actuator_depth.fetch_add(1, Ordering::Relaxed);
        self.actuator
            .send(ActuatorMessage {
                agent_id: agent_id.to_owned(),
                event,
            })
            .map_err(|_| {
                self.actuator_depth.fetch_sub(1, Ordering::Relaxed);
                TransportError::Closed("actuator")
            })
    }

    fn send_sensor(&self, event: AttributeEvent) -> Result<(), TransportError> {
        self.sensor
            .send(event)
            .map_err(|_| TransportError::Closed("sensor"))
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_ams_model::AttributeRef;
    use serde_json::json;

    #[tokio::test]
    async fn actuator_depth_tracks_backlog() {
        let (bus, mut receivers) = ChannelBus::new();
        let event = AttributeEvent::new(AttributeRef::new("a", "level"), json!(1));
        bus.send_actuator("agent", event.clone()).unwrap();
        bus.send_actuator("agent", event.clone()).unwrap();
        assert_eq!(receivers.actuator.depth(), 2);

        let message = receivers.actuator.recv().await.unwrap();
        assert_eq!(message.agent_id, "agent");
        assert_eq!(message.event, event);
        assert_eq!(receivers.actuator.depth(), 1);
    }

    #[test]
    fn closed_channels_report_errors() {
        let (bus, receivers) = ChannelBus::new();
        drop(receivers);
        let event = AttributeEvent::new(AttributeRef::new("a", "level"), json!(1));
        assert!(matches!(
            bus.send_sensor(event.clone()),
            Err(TransportError::Closed("sensor"))
        ));
        assert!(bus.send_actuator("agent", event).is_err());
    }
}
