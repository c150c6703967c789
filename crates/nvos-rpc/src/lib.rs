//! NVOS RPC surface
//!
//! Capability services keyed by device address, plus device reflection and
//! a heartbeat. The wire transport is not part of this crate: a server loop
//! decodes `(service, method, payload)` triples and hands them to
//! [`RpcDispatcher::call`].
//!
//! | Service | Methods |
//! |---------|---------|
//! | `GPS` | GetLocation, GetAltitude, HasFix, GetSpeed, GetHeading, GetNumSatellites, GetFullReport, GetVerticalAccuracy, GetHorizontalAccuracy |
//! | `LEDController` | GetState, SetBrightness, SetMode, SetPowerState |
//! | `LightSensor` | GetSupportedGains/Intervals/Channels, Get/SetGain, Get/SetInterval, Get/SetAutoGainEnabled, GetLuminosity, GetIlluminance |
//! | `Thermometer` | GetSupportedGains/Intervals, Get/SetGain, Get/SetInterval, GetTemperatureCelsius/Fahrenheit |
//! | `Barometer` | GetSupportedGains/Intervals, Get/SetGain, Get/SetInterval, GetPressure, GetAltitude |
//! | `DeviceReflection` | ListDevices, ListControllers, ListCapabilities |
//! | `Heartbeat` | Ping |

pub mod dispatch;
pub mod messages;
pub mod services;
pub mod status;

pub use dispatch::RpcDispatcher;
pub use services::RpcService;
pub use status::{Code, Status};
