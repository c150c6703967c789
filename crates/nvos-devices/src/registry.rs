//! Device Registry - the live set of bus controllers and devices.
//!
//! Registration is one logical transaction: resolve the controller and the
//! driver factory, build the driver, let it probe the hardware and take its
//! resources, and only then publish the device. A failed registration
//! releases every resource taken under the device address before the error
//! is returned, so a half-initialized device is never observable.
//!
//! Mutations (register, unregister, start, stop) are serialized against each
//! other. Lookups and listings only take the read side of the map locks and
//! never wait for hardware I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use nvos_core::{Configuration, DeviceConfig, DeviceEvent, EventBus, RetryPolicy};

use crate::arbiter::ExclusivityArbiter;
use crate::bus::{BusController, BusKind};
use crate::capability::{
    Barometer, Capability, CapabilityHandle, CapabilityTable, Gps, LedController, LightSensor,
    Thermometer,
};
use crate::driver::{DeviceDriver, DriverCatalog, DriverContext, DriverInstance};
use crate::error::DeviceError;

const EVENT_SOURCE: &str = "registry";

/// Reflection record of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub address: String,
    pub capabilities: BTreeSet<Capability>,
    pub device_name: String,
    pub driver_name: String,
    /// Controller the device is attached to.
    pub controller: String,
    pub is_running: bool,
    pub registered_at: DateTime<Utc>,
}

/// Reflection record of one bus controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInfo {
    pub name: String,
    pub kind: BusKind,
}

/// Request to attach a driver at an address.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpec {
    pub address: String,
    pub driver: String,
    pub controller: String,
    /// Capabilities to advertise; `None` advertises everything the driver implements.
    pub capabilities: Option<BTreeSet<Capability>>,
    /// Overrides the driver-provided device name.
    pub name: Option<String>,
    pub config: serde_json::Value,
}

impl DeviceSpec {
    pub fn new(
        address: impl Into<String>,
        driver: impl Into<String>,
        controller: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            driver: driver.into(),
            controller: controller.into(),
            capabilities: None,
            name: None,
            config: serde_json::Value::Null,
        }
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = Some(capabilities.into_iter().collect());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

impl TryFrom<&DeviceConfig> for DeviceSpec {
    type Error = DeviceError;

    fn try_from(config: &DeviceConfig) -> Result<Self, Self::Error> {
        let capabilities = config
            .capabilities
            .as_ref()
            .map(|tags| {
                tags.iter()
                    .map(|tag| tag.parse::<Capability>())
                    .collect::<Result<BTreeSet<_>, _>>()
            })
            .transpose()?;

        Ok(Self {
            address: config.address.clone(),
            driver: config.driver.clone(),
            controller: config.controller.clone(),
            capabilities,
            name: config.name.clone(),
            config: config.data.clone(),
        })
    }
}

/// Point-in-time copy of registry contents.
///
/// Cheap to clone; every call to [`iter`](Self::iter) starts over.
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
    items: Arc<[T]>,
}

impl<T> Snapshot<T> {
    fn new(items: Vec<T>) -> Self {
        Self {
            items: items.into(),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Clone> Snapshot<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.to_vec()
    }
}

impl<'a, T> IntoIterator for &'a Snapshot<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Timing handed to drivers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistrySettings {
    pub acquire_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_millis(1000),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&Configuration> for RegistrySettings {
    fn from(config: &Configuration) -> Self {
        Self {
            acquire_timeout: config.arbiter.acquire_timeout(),
            retry: config.driver.retry_policy(),
        }
    }
}

struct DeviceEntry {
    info: DeviceInfo,
    driver: Arc<dyn DeviceDriver>,
    table: CapabilityTable,
}

/// Device registry.
pub struct DeviceRegistry {
    /// Published devices, keyed by address
    devices: RwLock<BTreeMap<String, DeviceEntry>>,
    /// Loaded controllers; never removed
    controllers: RwLock<BTreeMap<String, Arc<BusController>>>,
    /// Serializes register, unregister, start and stop
    mutation: Mutex<()>,
    arbiter: Arc<ExclusivityArbiter>,
    catalog: DriverCatalog,
    settings: RegistrySettings,
    event_bus: EventBus,
}

impl DeviceRegistry {
    /// Registry with the built-in driver catalog and its own arbiter.
    pub fn new() -> Self {
        Self::with_catalog(DriverCatalog::builtin())
    }

    pub fn with_catalog(catalog: DriverCatalog) -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
            controllers: RwLock::new(BTreeMap::new()),
            mutation: Mutex::new(()),
            arbiter: Arc::new(ExclusivityArbiter::new()),
            catalog,
            settings: RegistrySettings::default(),
            event_bus: EventBus::with_name("devices"),
        }
    }

    pub fn with_settings(mut self, settings: RegistrySettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Arbiter every controller of this registry must be built with.
    pub fn arbiter(&self) -> &Arc<ExclusivityArbiter> {
        &self.arbiter
    }

    pub fn catalog(&self) -> &DriverCatalog {
        &self.catalog
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn settings(&self) -> RegistrySettings {
        self.settings
    }

    // ========== Controllers ==========

    /// Publish a loaded controller. Names are never reused.
    pub async fn add_controller(&self, controller: Arc<BusController>) -> Result<(), DeviceError> {
        if !Arc::ptr_eq(controller.arbiter(), &self.arbiter) {
            return Err(DeviceError::InvalidSpec(format!(
                "controller '{}' was built with a different arbiter",
                controller.name()
            )));
        }

        {
            let mut controllers = self.controllers.write().await;
            if controllers.contains_key(controller.name()) {
                return Err(DeviceError::DuplicateController(controller.name().to_string()));
            }
            controllers.insert(controller.name().to_string(), controller.clone());
        }

        tracing::info!(name = controller.name(), kind = %controller.kind(), "bus controller loaded");
        self.event_bus.publish(
            DeviceEvent::ControllerLoaded {
                name: controller.name().to_string(),
                kind: controller.kind().to_string(),
            },
            EVENT_SOURCE,
        );
        Ok(())
    }

    pub async fn controller(&self, name: &str) -> Option<Arc<BusController>> {
        self.controllers.read().await.get(name).cloned()
    }

    pub async fn list_controllers(&self) -> Snapshot<ControllerInfo> {
        let controllers = self.controllers.read().await;
        Snapshot::new(
            controllers
                .values()
                .map(|c| ControllerInfo {
                    name: c.name().to_string(),
                    kind: c.kind(),
                })
                .collect(),
        )
    }

    // ========== Devices ==========

    /// Attach a driver and publish the device.
    pub async fn register(&self, spec: DeviceSpec) -> Result<DeviceInfo, DeviceError> {
        let _guard = self.mutation.lock().await;

        if self.devices.read().await.contains_key(&spec.address) {
            return Err(DeviceError::DuplicateAddress(spec.address));
        }
        if spec.address.trim().is_empty() {
            return Err(DeviceError::InvalidArgument(
                "device address cannot be empty".to_string(),
            ));
        }

        let (controller, controllers) = {
            let controllers = self.controllers.read().await;
            let controller = controllers
                .get(&spec.controller)
                .cloned()
                .ok_or_else(|| DeviceError::UnknownBusController(spec.controller.clone()))?;
            (controller, controllers.clone())
        };

        let factory = self.catalog.get(&spec.driver)?;
        if !factory.supported_buses().contains(&controller.kind()) {
            return Err(DeviceError::InvalidConfig(format!(
                "driver '{}' cannot run on {} controller '{}'",
                spec.driver,
                controller.kind(),
                controller.name()
            )));
        }

        let DriverInstance {
            driver,
            capabilities: mut table,
        } = factory.create(&spec.config)?;

        let implemented = table.capabilities();
        let advertised = match spec.capabilities {
            // An empty declaration advertises the full table
            Some(ref declared) if !declared.is_empty() => {
                if let Some(missing) = declared.difference(&implemented).next() {
                    return Err(DeviceError::CapabilityNotSupported {
                        address: spec.address.clone(),
                        capability: *missing,
                    });
                }
                declared.clone()
            }
            _ => implemented,
        };
        table.restrict_to(&advertised);

        let ctx = DriverContext::new(
            spec.address.clone(),
            controller.clone(),
            controllers,
            self.settings.acquire_timeout,
            self.settings.retry,
        );
        if let Err(e) = driver.start(&ctx).await {
            self.unwind(&spec.address, driver.as_ref()).await;
            return Err(init_error(&spec.address, e));
        }

        let info = DeviceInfo {
            address: spec.address.clone(),
            capabilities: advertised,
            device_name: spec.name.unwrap_or_else(|| driver.device_name()),
            driver_name: driver.driver_name().to_string(),
            controller: controller.name().to_string(),
            is_running: true,
            registered_at: Utc::now(),
        };

        self.devices.write().await.insert(
            spec.address.clone(),
            DeviceEntry {
                info: info.clone(),
                driver,
                table,
            },
        );

        tracing::info!(
            address = %info.address,
            driver = %info.driver_name,
            controller = %info.controller,
            "device registered"
        );
        self.event_bus.publish(
            DeviceEvent::DeviceRegistered {
                address: info.address.clone(),
                driver: info.driver_name.clone(),
                capabilities: info.capabilities.iter().map(|c| c.to_string()).collect(),
            },
            EVENT_SOURCE,
        );
        Ok(info)
    }

    /// Stop the driver, release its resources and remove the device.
    ///
    /// If the driver fails to stop, its resources are still released and the
    /// device stays listed as not running; calling `unregister` again
    /// finishes the removal.
    pub async fn unregister(&self, address: &str) -> Result<(), DeviceError> {
        let _guard = self.mutation.lock().await;

        let driver = self.driver(address).await?;
        let stopped = driver.stop().await;
        let freed = self.arbiter.release_owner(address);

        if let Err(e) = stopped {
            self.set_running(address, false).await;
            tracing::warn!(address, error = %e, "driver failed to stop, device kept for retry");
            return Err(e);
        }

        self.devices.write().await.remove(address);
        tracing::info!(address, released = freed.len(), "device unregistered");
        self.event_bus.publish(
            DeviceEvent::DeviceUnregistered {
                address: address.to_string(),
            },
            EVENT_SOURCE,
        );
        Ok(())
    }

    /// Stop a device but keep it registered.
    pub async fn stop_device(&self, address: &str) -> Result<(), DeviceError> {
        let _guard = self.mutation.lock().await;

        let (driver, running) = {
            let devices = self.devices.read().await;
            let entry = devices
                .get(address)
                .ok_or_else(|| DeviceError::NotFound(address.to_string()))?;
            (entry.driver.clone(), entry.info.is_running)
        };
        if !running {
            return Ok(());
        }

        let stopped = driver.stop().await;
        self.arbiter.release_owner(address);
        self.set_running(address, false).await;
        self.publish_state(address, false);
        stopped
    }

    /// Restart a stopped device on its original controller.
    pub async fn start_device(&self, address: &str) -> Result<(), DeviceError> {
        let _guard = self.mutation.lock().await;

        let (driver, running, controller_name) = {
            let devices = self.devices.read().await;
            let entry = devices
                .get(address)
                .ok_or_else(|| DeviceError::NotFound(address.to_string()))?;
            (
                entry.driver.clone(),
                entry.info.is_running,
                entry.info.controller.clone(),
            )
        };
        if running {
            return Ok(());
        }

        let (controller, controllers) = {
            let controllers = self.controllers.read().await;
            let controller = controllers.get(&controller_name).cloned().ok_or_else(|| {
                DeviceError::Internal(format!(
                    "controller '{}' of device '{}' disappeared",
                    controller_name, address
                ))
            })?;
            (controller, controllers.clone())
        };

        let ctx = DriverContext::new(
            address,
            controller,
            controllers,
            self.settings.acquire_timeout,
            self.settings.retry,
        );
        if let Err(e) = driver.start(&ctx).await {
            self.unwind(address, driver.as_ref()).await;
            return Err(init_error(address, e));
        }

        self.set_running(address, true).await;
        self.publish_state(address, true);
        Ok(())
    }

    /// Resolve the implementation of `capability` on the device at `address`.
    pub async fn lookup(
        &self,
        address: &str,
        capability: Capability,
    ) -> Result<CapabilityHandle, DeviceError> {
        let devices = self.devices.read().await;
        let entry = devices
            .get(address)
            .ok_or_else(|| DeviceError::NotFound(address.to_string()))?;

        if !entry.info.capabilities.contains(&capability) {
            return Err(DeviceError::CapabilityNotSupported {
                address: address.to_string(),
                capability,
            });
        }
        if !entry.info.is_running {
            return Err(DeviceError::NotRunning(address.to_string()));
        }

        entry.table.get(capability).cloned().ok_or_else(|| {
            DeviceError::Internal(format!(
                "device '{}' advertises {} without an implementation",
                address, capability
            ))
        })
    }

    pub async fn led(&self, address: &str) -> Result<Arc<dyn LedController>, DeviceError> {
        match self.lookup(address, Capability::LedController).await? {
            CapabilityHandle::LedController(led) => Ok(led),
            other => Err(mismatch(address, Capability::LedController, &other)),
        }
    }

    pub async fn gps(&self, address: &str) -> Result<Arc<dyn Gps>, DeviceError> {
        match self.lookup(address, Capability::Gps).await? {
            CapabilityHandle::Gps(gps) => Ok(gps),
            other => Err(mismatch(address, Capability::Gps, &other)),
        }
    }

    pub async fn light_sensor(&self, address: &str) -> Result<Arc<dyn LightSensor>, DeviceError> {
        match self.lookup(address, Capability::LightSensor).await? {
            CapabilityHandle::LightSensor(sensor) => Ok(sensor),
            other => Err(mismatch(address, Capability::LightSensor, &other)),
        }
    }

    pub async fn thermometer(&self, address: &str) -> Result<Arc<dyn Thermometer>, DeviceError> {
        match self.lookup(address, Capability::Thermometer).await? {
            CapabilityHandle::Thermometer(thermometer) => Ok(thermometer),
            other => Err(mismatch(address, Capability::Thermometer, &other)),
        }
    }

    pub async fn barometer(&self, address: &str) -> Result<Arc<dyn Barometer>, DeviceError> {
        match self.lookup(address, Capability::Barometer).await? {
            CapabilityHandle::Barometer(barometer) => Ok(barometer),
            other => Err(mismatch(address, Capability::Barometer, &other)),
        }
    }

    pub async fn device(&self, address: &str) -> Result<DeviceInfo, DeviceError> {
        self.devices
            .read()
            .await
            .get(address)
            .map(|entry| entry.info.clone())
            .ok_or_else(|| DeviceError::NotFound(address.to_string()))
    }

    pub async fn list_devices(&self) -> Snapshot<DeviceInfo> {
        let devices = self.devices.read().await;
        Snapshot::new(devices.values().map(|entry| entry.info.clone()).collect())
    }

    pub async fn addresses(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }

    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    // ========== Internals ==========

    async fn driver(&self, address: &str) -> Result<Arc<dyn DeviceDriver>, DeviceError> {
        self.devices
            .read()
            .await
            .get(address)
            .map(|entry| entry.driver.clone())
            .ok_or_else(|| DeviceError::NotFound(address.to_string()))
    }

    async fn set_running(&self, address: &str, running: bool) {
        if let Some(entry) = self.devices.write().await.get_mut(address) {
            entry.info.is_running = running;
        }
    }

    fn publish_state(&self, address: &str, running: bool) {
        tracing::info!(address, running, "device state changed");
        self.event_bus.publish(
            DeviceEvent::DeviceStateChanged {
                address: address.to_string(),
                running,
            },
            EVENT_SOURCE,
        );
    }

    /// Undo a failed start: quiesce whatever the driver set up and release
    /// every resource held under the address.
    async fn unwind(&self, address: &str, driver: &dyn DeviceDriver) {
        if let Err(e) = driver.stop().await {
            tracing::debug!(address, error = %e, "stop after failed start reported an error");
        }
        let freed = self.arbiter.release_owner(address);
        if !freed.is_empty() {
            tracing::debug!(address, resources = ?freed, "released resources of failed start");
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Contention stays retryable; every other start failure is an initialization error.
fn init_error(address: &str, error: DeviceError) -> DeviceError {
    match error {
        DeviceError::ResourceBusy { .. } | DeviceError::DriverInitFailed { .. } => error,
        other => DeviceError::DriverInitFailed {
            address: address.to_string(),
            reason: other.to_string(),
        },
    }
}

fn mismatch(address: &str, wanted: Capability, found: &CapabilityHandle) -> DeviceError {
    DeviceError::Internal(format!(
        "device '{}' maps {} to a {} implementation",
        address,
        wanted,
        found.capability()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_spec_from_config() {
        let mut config = DeviceConfig::new("i2c1:bmp", "bmp280", "i2c1");
        config.capabilities = Some(vec!["Thermometer".to_string()]);

        let spec = DeviceSpec::try_from(&config).unwrap();
        assert_eq!(
            spec.capabilities,
            Some(BTreeSet::from([Capability::Thermometer]))
        );

        config.capabilities = Some(vec!["Compass".to_string()]);
        assert!(DeviceSpec::try_from(&config).is_err());
    }

    #[test]
    fn test_snapshot_is_restartable() {
        let snapshot = Snapshot::new(vec![1, 2, 3]);
        assert_eq!(snapshot.iter().sum::<i32>(), 6);
        assert_eq!(snapshot.iter().count(), snapshot.len());
        assert_eq!((&snapshot).into_iter().max(), Some(&3));
    }

    #[test]
    fn test_init_error_keeps_contention_retryable() {
        let busy = DeviceError::ResourceBusy {
            resource: "uart:uart0:0".into(),
            holder: "other".into(),
        };
        assert_eq!(init_error("gps", busy.clone()), busy);
        assert!(matches!(
            init_error("gps", DeviceError::Hardware("nack".into())),
            DeviceError::DriverInitFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_controller() {
        let registry = DeviceRegistry::new();
        assert_eq!(
            registry
                .register(DeviceSpec::new("a", "tsl2591", "i2c9"))
                .await
                .unwrap_err(),
            DeviceError::UnknownBusController("i2c9".to_string())
        );
        assert!(registry.list_devices().await.is_empty());
        assert!(matches!(
            registry.lookup("a", Capability::LightSensor).await,
            Err(DeviceError::NotFound(_))
        ));
    }
}
