//! Drivers shipped with the firmware.

pub mod bmp280;
pub mod gps;
pub mod led;
pub mod nmea;
pub mod tsl2591;

use std::sync::Arc;

use nvos_core::RetryPolicy;

use crate::bus::{BusController, ChannelLease, ChannelSetting};
use crate::driver::DriverFactory;
use crate::error::DeviceError;

pub use bmp280::{Bmp280Driver, Bmp280Factory};
pub use gps::{GpsDriver, GpsUartFactory};
pub use led::{LedDriver, LedFactory};
pub use tsl2591::{Tsl2591Driver, Tsl2591Factory};

/// Factories of every built-in driver.
pub fn builtin_drivers() -> Vec<Arc<dyn DriverFactory>> {
    vec![
        Arc::new(LedFactory),
        Arc::new(GpsUartFactory),
        Arc::new(Tsl2591Factory),
        Arc::new(Bmp280Factory),
    ]
}

/// A leased channel together with the controller it belongs to.
///
/// All I/O goes through the driver's retry policy.
pub(crate) struct BusLink {
    controller: Arc<BusController>,
    lease: ChannelLease,
    retry: RetryPolicy,
}

impl BusLink {
    pub(crate) fn new(controller: Arc<BusController>, lease: ChannelLease, retry: RetryPolicy) -> Self {
        Self {
            controller,
            lease,
            retry,
        }
    }

    pub(crate) async fn configure(&self, setting: &ChannelSetting) -> Result<(), DeviceError> {
        let (controller, lease) = (&self.controller, &self.lease);
        self.retry
            .run("configure", move || controller.configure(lease, setting))
            .await
    }

    pub(crate) async fn read(&self, len: usize) -> Result<Vec<u8>, DeviceError> {
        let (controller, lease) = (&self.controller, &self.lease);
        self.retry
            .run("read", move || controller.read(lease, len))
            .await
    }

    pub(crate) async fn set_level(&self, high: bool) -> Result<(), DeviceError> {
        let (controller, lease) = (&self.controller, &self.lease);
        self.retry
            .run("set_level", move || controller.set_level(lease, high))
            .await
    }

    pub(crate) async fn read_register(&self, register: u8, len: usize) -> Result<Vec<u8>, DeviceError> {
        let (controller, lease) = (&self.controller, &self.lease);
        self.retry
            .run("read_register", move || controller.read_register(lease, register, len))
            .await
    }

    pub(crate) async fn write_register(&self, register: u8, data: &[u8]) -> Result<(), DeviceError> {
        let (controller, lease) = (&self.controller, &self.lease);
        self.retry
            .run("write_register", move || {
                controller.write_register(lease, register, data)
            })
            .await
    }

    /// Give the channel back. Leases already reclaimed by the registry are fine.
    pub(crate) async fn release(self) {
        let resource = self.lease.resource().to_string();
        match self.controller.release(self.lease).await {
            Ok(()) | Err(DeviceError::AlreadyReleased(_)) => {}
            Err(e) => tracing::warn!(resource = %resource, error = %e, "failed to release channel"),
        }
    }
}
