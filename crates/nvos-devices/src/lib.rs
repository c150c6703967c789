//! NVOS Device Framework
//!
//! Hardware access for the root controller: bus controllers, device
//! drivers and the capability interfaces RPC services dispatch to.
//!
//! ## Architecture
//!
//! - **BusController**: a named hardware bus (GPIO, PWM, I2C, UART) backed by a `Transport`
//! - **ExclusivityArbiter**: grants exclusive use of bus channels to device addresses
//! - **DeviceDriver**: probes hardware and implements one or more capabilities
//! - **DeviceRegistry**: live devices, keyed by address, with capability lookup
//! - **DeviceService**: loads controllers and drivers from configuration
//!
//! Capabilities (`LedController`, `Gps`, `LightSensor`, `Thermometer`,
//! `Barometer`) are async traits; the registry hands out shared handles to
//! the driver implementing them.

pub mod arbiter;
pub mod bus;
pub mod capability;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod registry;
pub mod service;

pub use arbiter::{ExclusivityArbiter, ExclusivityToken};
pub use bus::{
    BusController, BusFamily, BusKind, ChannelLease, ChannelSetting, Direction, Parity,
    SimulatedProvider, SimulatedTransport, Transport, TransportProvider,
};
pub use capability::{
    Barometer, Capability, CapabilityHandle, CapabilityTable, GainValue, GeoPoint, Gps, GpsReport,
    IntegrationTime, LedController, LedMode, LedState, LightChannel, LightSensor, SleepInterval,
    Thermometer,
};
pub use driver::{DeviceDriver, DriverCatalog, DriverContext, DriverFactory, DriverInstance};
pub use error::{DeviceError, TransportError};
pub use registry::{
    ControllerInfo, DeviceInfo, DeviceRegistry, DeviceSpec, RegistrySettings, Snapshot,
};
pub use service::{BootstrapFailure, BootstrapReport, ControllerSpec, DeviceService};
