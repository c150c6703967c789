//! Events published when the device registry changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registry or controller lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    /// A bus controller was instantiated.
    ControllerLoaded { name: String, kind: String },
    /// A device finished initialization and became visible.
    DeviceRegistered {
        address: String,
        driver: String,
        capabilities: Vec<String>,
    },
    /// A device was removed from the registry.
    DeviceUnregistered { address: String },
    /// A registered device was started or stopped.
    DeviceStateChanged { address: String, running: bool },
}

impl DeviceEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            DeviceEvent::ControllerLoaded { .. } => "ControllerLoaded",
            DeviceEvent::DeviceRegistered { .. } => "DeviceRegistered",
            DeviceEvent::DeviceUnregistered { .. } => "DeviceUnregistered",
            DeviceEvent::DeviceStateChanged { .. } => "DeviceStateChanged",
        }
    }

    /// Device address the event refers to, if any.
    pub fn address(&self) -> Option<&str> {
        match self {
            DeviceEvent::ControllerLoaded { .. } => None,
            DeviceEvent::DeviceRegistered { address, .. }
            | DeviceEvent::DeviceUnregistered { address }
            | DeviceEvent::DeviceStateChanged { address, .. } => Some(address),
        }
    }
}

/// Metadata attached to every published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Component that published the event.
    pub source: String,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
        }
    }
}
