//! Driver trait, driver factories and the static driver catalog.
//!
//! Drivers are compiled into the binary. A configuration file selects them
//! by name through the [`DriverCatalog`], whose factories build a driver and
//! its capability table from a JSON settings blob.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use nvos_core::RetryPolicy;

use crate::bus::{BusController, BusKind, ChannelLease};
use crate::capability::{Capability, CapabilityTable};
use crate::error::DeviceError;

/// What a driver gets to see while starting.
pub struct DriverContext {
    address: String,
    controller: Arc<BusController>,
    controllers: BTreeMap<String, Arc<BusController>>,
    acquire_timeout: Duration,
    retry: RetryPolicy,
}

impl DriverContext {
    pub fn new(
        address: impl Into<String>,
        controller: Arc<BusController>,
        controllers: BTreeMap<String, Arc<BusController>>,
        acquire_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            address: address.into(),
            controller,
            controllers,
            acquire_timeout,
            retry,
        }
    }

    /// Device address; also the owner id of every resource the driver acquires.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The controller the device was registered on.
    pub fn controller(&self) -> &Arc<BusController> {
        &self.controller
    }

    /// Another loaded controller, for drivers spanning several buses.
    pub fn controller_named(&self, name: &str) -> Result<Arc<BusController>, DeviceError> {
        self.controllers
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownBusController(name.to_string()))
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Acquire `channel` of `controller` on behalf of this device.
    pub async fn acquire(
        &self,
        controller: &BusController,
        channel: u32,
    ) -> Result<ChannelLease, DeviceError> {
        controller
            .acquire(channel, &self.address, self.acquire_timeout)
            .await
    }
}

/// Lifecycle of one driver instance.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    fn driver_name(&self) -> &'static str;

    /// Human readable device name.
    fn device_name(&self) -> String;

    /// Probe the hardware and take the resources the driver needs.
    ///
    /// On error the registry releases everything acquired under the device address.
    async fn start(&self, ctx: &DriverContext) -> Result<(), DeviceError>;

    /// Quiesce the hardware and give back resources.
    async fn stop(&self) -> Result<(), DeviceError>;

    fn is_running(&self) -> bool;
}

/// A freshly built driver and the capabilities it implements.
pub struct DriverInstance {
    pub driver: Arc<dyn DeviceDriver>,
    pub capabilities: CapabilityTable,
}

/// Builds drivers of one kind.
pub trait DriverFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Capabilities every instance implements.
    fn capabilities(&self) -> Vec<Capability>;

    /// Controller kinds the driver can be registered on.
    fn supported_buses(&self) -> &'static [BusKind];

    fn create(&self, config: &serde_json::Value) -> Result<DriverInstance, DeviceError>;
}

/// Parse driver settings, treating a missing blob as all defaults.
pub fn parse_config<T>(config: &serde_json::Value) -> Result<T, DeviceError>
where
    T: DeserializeOwned + Default,
{
    if config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(config.clone()).map_err(|e| DeviceError::InvalidConfig(e.to_string()))
}

/// Name-keyed table of driver factories.
#[derive(Clone, Default)]
pub struct DriverCatalog {
    factories: BTreeMap<&'static str, Arc<dyn DriverFactory>>,
}

impl DriverCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog of every driver shipped with the firmware.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for factory in crate::drivers::builtin_drivers() {
            // Built-in names are distinct.
            let _ = catalog.register(factory);
        }
        catalog
    }

    pub fn register(&mut self, factory: Arc<dyn DriverFactory>) -> Result<(), DeviceError> {
        let name = factory.name();
        if self.factories.contains_key(name) {
            return Err(DeviceError::InvalidSpec(format!(
                "driver '{}' is already in the catalog",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn DriverFactory>, DeviceError> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownDriver(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DriverFactory>> {
        self.factories.values()
    }
}

impl std::fmt::Debug for DriverCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverCatalog")
            .field("drivers", &self.names())
            .finish()
    }
}
