//! Device Service - loading controllers and drivers from configuration
//!
//! This service provides a high-level API for:
//! - Opening bus controllers through a transport provider
//! - Attaching drivers to controllers
//! - Bootstrapping everything a configuration file describes
//! - Tearing devices down on shutdown

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use nvos_core::{Configuration, ControllerConfig};

use crate::bus::{BusController, BusKind, TransportProvider, DEFAULT_IO_TIMEOUT};
use crate::driver::DriverCatalog;
use crate::error::DeviceError;
use crate::registry::{DeviceInfo, DeviceRegistry, DeviceSpec, RegistrySettings};

/// A validated request to load a bus controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSpec {
    pub name: String,
    pub kind: BusKind,
    pub channels: Option<Vec<u32>>,
    /// Backend specific parameters, passed to the transport provider.
    pub data: serde_json::Value,
}

impl ControllerSpec {
    pub fn new(name: impl Into<String>, kind: BusKind) -> Self {
        Self {
            name: name.into(),
            kind,
            channels: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_channels(mut self, channels: impl IntoIterator<Item = u32>) -> Self {
        self.channels = Some(channels.into_iter().collect());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

impl TryFrom<&ControllerConfig> for ControllerSpec {
    type Error = DeviceError;

    fn try_from(config: &ControllerConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            name: config.name.clone(),
            kind: config.kind.parse()?,
            channels: config.channels.clone(),
            data: config.data.clone(),
        })
    }
}

/// One entry of a configuration that could not be loaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BootstrapFailure {
    /// `controller <name>` or `device <address>`
    pub item: String,
    pub error: String,
}

/// Outcome of [`DeviceService::bootstrap`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BootstrapReport {
    pub controllers_loaded: usize,
    pub devices_loaded: usize,
    pub failures: Vec<BootstrapFailure>,
}

impl BootstrapReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Device service.
pub struct DeviceService {
    registry: Arc<DeviceRegistry>,
    provider: Arc<dyn TransportProvider>,
    io_timeout: Duration,
}

impl DeviceService {
    pub fn new(registry: Arc<DeviceRegistry>, provider: Arc<dyn TransportProvider>) -> Self {
        Self {
            registry,
            provider,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    /// Service with a fresh registry using the built-in drivers and the
    /// timing settings of `config`.
    pub fn from_config(config: &Configuration, provider: Arc<dyn TransportProvider>) -> Self {
        let registry = DeviceRegistry::with_catalog(DriverCatalog::builtin())
            .with_settings(RegistrySettings::from(config));
        Self::new(Arc::new(registry), provider).with_io_timeout(config.driver.io_timeout())
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Open a transport and publish the controller under its name.
    pub async fn load_controller(
        &self,
        spec: ControllerSpec,
    ) -> Result<Arc<BusController>, DeviceError> {
        if spec.name.trim().is_empty() {
            return Err(DeviceError::InvalidSpec(
                "controller name cannot be empty".to_string(),
            ));
        }
        if self.registry.controller(&spec.name).await.is_some() {
            return Err(DeviceError::DuplicateController(spec.name));
        }

        let transport = self
            .provider
            .open(&spec.name, spec.kind, &spec.data)
            .map_err(|e| DeviceError::ControllerInitFailed {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;

        let mut controller = BusController::new(
            spec.name,
            spec.kind,
            transport,
            self.registry.arbiter().clone(),
        )
        .with_io_timeout(self.io_timeout);
        if let Some(channels) = spec.channels {
            controller = controller.with_channels(channels);
        }

        let controller = Arc::new(controller);
        self.registry.add_controller(controller.clone()).await?;
        Ok(controller)
    }

    /// Attach `driver` at `address` on `controller`, advertising every
    /// capability the driver implements.
    pub async fn load_driver(
        &self,
        driver: &str,
        address: &str,
        controller: &str,
        config: serde_json::Value,
    ) -> Result<DeviceInfo, DeviceError> {
        self.registry
            .register(DeviceSpec::new(address, driver, controller).with_config(config))
            .await
    }

    pub async fn load_device(&self, spec: DeviceSpec) -> Result<DeviceInfo, DeviceError> {
        self.registry.register(spec).await
    }

    /// Load every controller, then every device, of `config`.
    ///
    /// Entries that fail are logged and skipped; the rest still load.
    pub async fn bootstrap(&self, config: &Configuration) -> BootstrapReport {
        let mut report = BootstrapReport::default();

        for entry in &config.controllers {
            let loaded = match ControllerSpec::try_from(entry) {
                Ok(spec) => self.load_controller(spec).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match loaded {
                Ok(()) => report.controllers_loaded += 1,
                Err(e) => {
                    tracing::warn!(controller = %entry.name, error = %e, "failed to load controller");
                    report.failures.push(BootstrapFailure {
                        item: format!("controller {}", entry.name),
                        error: e.to_string(),
                    });
                }
            }
        }

        for entry in &config.devices {
            let loaded = match DeviceSpec::try_from(entry) {
                Ok(spec) => self.load_device(spec).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match loaded {
                Ok(()) => report.devices_loaded += 1,
                Err(e) => {
                    tracing::warn!(
                        address = %entry.address,
                        driver = %entry.driver,
                        error = %e,
                        "failed to load device"
                    );
                    report.failures.push(BootstrapFailure {
                        item: format!("device {}", entry.address),
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            controllers = report.controllers_loaded,
            devices = report.devices_loaded,
            failures = report.failures.len(),
            "bootstrap complete"
        );
        report
    }

    /// Unregister every device. Returns the devices that failed to stop.
    pub async fn shutdown(&self) -> Vec<(String, DeviceError)> {
        let mut failures = Vec::new();
        for address in self.registry.addresses().await {
            if let Err(e) = self.registry.unregister(&address).await {
                tracing::error!(address = %address, error = %e, "device failed to shut down");
                failures.push((address, e));
            }
        }
        failures
    }
}
