//! Event bus carrying registry lifecycle events.
//!
//! Publishing never blocks. Subscribers that fall behind lose the oldest
//! events and keep receiving from there.

use crate::event::{DeviceEvent, EventMetadata};
use tokio::sync::broadcast;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast bus for [`DeviceEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    /// Broadcast channel sender
    tx: broadcast::Sender<(DeviceEvent, EventMetadata)>,
    /// Event bus name for identification
    name: String,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            name: "default".to_string(),
        }
    }

    /// Create a new event bus with a name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            tx: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event with `source` as the originating component.
    ///
    /// Returns `true` if there was at least one subscriber.
    pub fn publish(&self, event: DeviceEvent, source: impl Into<String>) -> bool {
        self.publish_with_metadata(event, EventMetadata::new(source))
    }

    pub fn publish_with_metadata(&self, event: DeviceEvent, metadata: EventMetadata) -> bool {
        tracing::trace!(bus = %self.name, event = event.type_name(), "publishing event");
        self.tx.send((event, metadata)).is_ok()
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Subscribe to events matching a filter.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&DeviceEvent) -> bool + Send + 'static,
    {
        FilteredReceiver {
            rx: self.tx.subscribe(),
            filter,
        }
    }

    /// Subscribe to events concerning a single device address.
    pub fn subscribe_device(
        &self,
        address: impl Into<String>,
    ) -> FilteredReceiver<impl Fn(&DeviceEvent) -> bool + Send + 'static> {
        let address = address.into();
        self.subscribe_filtered(move |event| event.address() == Some(address.as_str()))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for all events from the event bus.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(DeviceEvent, EventMetadata)>,
}

impl EventBusReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<(DeviceEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<(DeviceEvent, EventMetadata)> {
        self.rx.try_recv().ok()
    }
}

/// Receiver for filtered events from the event bus.
pub struct FilteredReceiver<F>
where
    F: Fn(&DeviceEvent) -> bool + Send,
{
    rx: broadcast::Receiver<(DeviceEvent, EventMetadata)>,
    filter: F,
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&DeviceEvent) -> bool + Send,
{
    /// Receive the next event matching the filter.
    pub async fn recv(&mut self) -> Option<(DeviceEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok((event, meta)) => {
                    if (self.filter)(&event) {
                        return Some((event, meta));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive a matching event without blocking.
    pub fn try_recv(&mut self) -> Option<(DeviceEvent, EventMetadata)> {
        while let Ok((event, meta)) = self.rx.try_recv() {
            if (self.filter)(&event) {
                return Some((event, meta));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered(address: &str) -> DeviceEvent {
        DeviceEvent::DeviceRegistered {
            address: address.to_string(),
            driver: "tsl2591".to_string(),
            capabilities: vec!["LightSensor".to_string()],
        }
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        assert!(bus.publish(registered("i2c1:tsl"), "registry"));

        let (event, meta) = rx.recv().await.unwrap();
        assert_eq!(event.type_name(), "DeviceRegistered");
        assert_eq!(meta.source, "registry");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::with_name("idle");
        assert_eq!(bus.subscriber_count(), 0);
        assert!(!bus.publish(registered("a"), "registry"));
    }

    #[tokio::test]
    async fn test_subscribe_device_filters_by_address() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_device("uart0:gps");

        bus.publish(registered("i2c1:tsl"), "registry");
        bus.publish(
            DeviceEvent::ControllerLoaded {
                name: "uart0".to_string(),
                kind: "uart".to_string(),
            },
            "service",
        );
        bus.publish(
            DeviceEvent::DeviceUnregistered {
                address: "uart0:gps".to_string(),
            },
            "registry",
        );

        let (event, _) = rx.recv().await.unwrap();
        assert_eq!(event.address(), Some("uart0:gps"));
        assert!(rx.try_recv().is_none());
    }
}
