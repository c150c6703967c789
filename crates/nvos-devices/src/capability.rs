//! Capability contracts.
//!
//! A capability is a named, versioned behavioural contract. Drivers
//! implement one trait per capability they offer and publish one handle per
//! capability in a [`CapabilityTable`]; the registry dispatches through that
//! table rather than through the driver type.

use async_trait::async_trait;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::DeviceError;

/// Sea level standard pressure in Pa.
pub const SEA_LEVEL_PRESSURE_PA: f32 = 101_325.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "LEDController")]
    LedController,
    #[serde(rename = "GPS")]
    Gps,
    LightSensor,
    Thermometer,
    Barometer,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::LedController,
        Capability::Gps,
        Capability::LightSensor,
        Capability::Thermometer,
        Capability::Barometer,
    ];

    /// Wire name of the capability.
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::LedController => "LEDController",
            Capability::Gps => "GPS",
            Capability::LightSensor => "LightSensor",
            Capability::Thermometer => "Thermometer",
            Capability::Barometer => "Barometer",
        }
    }

    /// Contract version. Bumped on incompatible changes to the trait.
    pub fn version(self) -> Version {
        Version::new(1, 0, 0)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DeviceError::InvalidArgument(format!("unknown capability '{}'", s)))
    }
}

/// Entry of a discrete option table, addressed by id.
pub trait OptionEntry: Clone {
    /// Option name used in error messages.
    const OPTION: &'static str;

    fn id(&self) -> u32;
}

/// Resolve `id` against `table`, failing with `UnsupportedOption`.
pub fn resolve_option<T: OptionEntry>(table: &[T], id: u32) -> Result<T, DeviceError> {
    table
        .iter()
        .find(|entry| entry.id() == id)
        .cloned()
        .ok_or(DeviceError::UnsupportedOption {
            option: T::OPTION,
            id,
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GainValue {
    pub id: u32,
    pub multiplier: u32,
}

impl OptionEntry for GainValue {
    const OPTION: &'static str = "gain";

    fn id(&self) -> u32 {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IntegrationTime {
    pub id: u32,
    pub time_ms: u32,
}

impl OptionEntry for IntegrationTime {
    const OPTION: &'static str = "integration time";

    fn id(&self) -> u32 {
        self.id
    }
}

/// Standby time between measurements of a sampling sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SleepInterval {
    pub id: u32,
    pub time_ms: u32,
}

impl OptionEntry for SleepInterval {
    const OPTION: &'static str = "sleep interval";

    fn id(&self) -> u32 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LightChannel {
    pub id: u32,
    pub name: String,
}

impl OptionEntry for LightChannel {
    const OPTION: &'static str = "light channel";

    fn id(&self) -> u32 {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LedMode {
    /// Visible spectrum
    #[default]
    #[serde(rename = "VIS")]
    Visible,
    /// Infrared
    #[serde(rename = "IR")]
    Infrared,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LedState {
    pub powered_on: bool,
    /// Between 0.0 and 1.0.
    pub brightness: f32,
    pub mode: LedMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Everything a GPS knows, read at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GpsReport {
    pub has_fix: bool,
    pub latitude: f64,
    pub longitude: f64,
    /// Meters above mean sea level
    pub altitude: f32,
    /// Knots
    pub speed_over_ground: f32,
    /// Degrees from true north
    pub heading: f32,
    pub satellite_count: u32,
    /// Meters
    pub vertical_accuracy: f32,
    /// Meters
    pub horizontal_accuracy: f32,
}

#[async_trait]
pub trait LedController: Send + Sync {
    async fn state(&self) -> Result<LedState, DeviceError>;

    /// Fails with `InvalidArgument` outside `0.0..=1.0`.
    async fn set_brightness(&self, brightness: f32) -> Result<(), DeviceError>;

    async fn set_mode(&self, mode: LedMode) -> Result<(), DeviceError>;

    async fn set_power(&self, on: bool) -> Result<(), DeviceError>;
}

#[async_trait]
pub trait Gps: Send + Sync {
    async fn has_fix(&self) -> Result<bool, DeviceError>;

    async fn location(&self) -> Result<GeoPoint, DeviceError>;

    async fn altitude(&self) -> Result<f32, DeviceError>;

    async fn speed(&self) -> Result<f32, DeviceError>;

    async fn heading(&self) -> Result<f32, DeviceError>;

    async fn satellite_count(&self) -> Result<u32, DeviceError>;

    async fn vertical_accuracy(&self) -> Result<f32, DeviceError>;

    async fn horizontal_accuracy(&self) -> Result<f32, DeviceError>;

    /// Unknown numeric fields are reported as zero.
    async fn full_report(&self) -> Result<GpsReport, DeviceError>;
}

#[async_trait]
pub trait LightSensor: Send + Sync {
    fn supported_gains(&self) -> Vec<GainValue>;

    fn supported_intervals(&self) -> Vec<IntegrationTime>;

    fn supported_channels(&self) -> Vec<LightChannel>;

    async fn gain(&self) -> Result<GainValue, DeviceError>;

    async fn set_gain(&self, id: u32) -> Result<(), DeviceError>;

    async fn interval(&self) -> Result<IntegrationTime, DeviceError>;

    async fn set_interval(&self, id: u32) -> Result<(), DeviceError>;

    async fn auto_gain_enabled(&self) -> Result<bool, DeviceError>;

    async fn set_auto_gain(&self, enabled: bool) -> Result<(), DeviceError>;

    /// Raw count of one channel.
    async fn luminosity(&self, channel_id: u32) -> Result<u32, DeviceError>;

    /// Lux.
    async fn illuminance(&self) -> Result<f32, DeviceError>;
}

#[async_trait]
pub trait Thermometer: Send + Sync {
    fn supported_gains(&self) -> Vec<GainValue>;

    fn supported_intervals(&self) -> Vec<SleepInterval>;

    async fn gain(&self) -> Result<GainValue, DeviceError>;

    async fn set_gain(&self, id: u32) -> Result<(), DeviceError>;

    async fn interval(&self) -> Result<SleepInterval, DeviceError>;

    async fn set_interval(&self, id: u32) -> Result<(), DeviceError>;

    async fn temperature_celsius(&self) -> Result<f32, DeviceError>;

    async fn temperature_fahrenheit(&self) -> Result<f32, DeviceError> {
        Ok(celsius_to_fahrenheit(self.temperature_celsius().await?))
    }
}

#[async_trait]
pub trait Barometer: Send + Sync {
    fn supported_gains(&self) -> Vec<GainValue>;

    fn supported_intervals(&self) -> Vec<SleepInterval>;

    async fn gain(&self) -> Result<GainValue, DeviceError>;

    async fn set_gain(&self, id: u32) -> Result<(), DeviceError>;

    async fn interval(&self) -> Result<SleepInterval, DeviceError>;

    async fn set_interval(&self, id: u32) -> Result<(), DeviceError>;

    /// Pa.
    async fn pressure(&self) -> Result<f32, DeviceError>;

    /// Meters above sea level, from the international barometric formula.
    async fn altitude(&self) -> Result<f32, DeviceError> {
        Ok(pressure_altitude(self.pressure().await?, SEA_LEVEL_PRESSURE_PA))
    }
}

pub fn celsius_to_fahrenheit(celsius: f32) -> f32 {
    celsius * 9.0 / 5.0 + 32.0
}

pub fn pressure_altitude(pressure_pa: f32, sea_level_pa: f32) -> f32 {
    44_330.0 * (1.0 - (pressure_pa / sea_level_pa).powf(1.0 / 5.255))
}

/// One capability implementation of one device.
#[derive(Clone)]
pub enum CapabilityHandle {
    LedController(Arc<dyn LedController>),
    Gps(Arc<dyn Gps>),
    LightSensor(Arc<dyn LightSensor>),
    Thermometer(Arc<dyn Thermometer>),
    Barometer(Arc<dyn Barometer>),
}

impl CapabilityHandle {
    pub fn capability(&self) -> Capability {
        match self {
            CapabilityHandle::LedController(_) => Capability::LedController,
            CapabilityHandle::Gps(_) => Capability::Gps,
            CapabilityHandle::LightSensor(_) => Capability::LightSensor,
            CapabilityHandle::Thermometer(_) => Capability::Thermometer,
            CapabilityHandle::Barometer(_) => Capability::Barometer,
        }
    }
}

impl fmt::Debug for CapabilityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilityHandle({})", self.capability())
    }
}

/// Capability-to-implementation table of one device.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    entries: BTreeMap<Capability, CapabilityHandle>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handle: CapabilityHandle) -> Self {
        self.insert(handle);
        self
    }

    pub fn with_led(self, led: Arc<dyn LedController>) -> Self {
        self.with(CapabilityHandle::LedController(led))
    }

    pub fn with_gps(self, gps: Arc<dyn Gps>) -> Self {
        self.with(CapabilityHandle::Gps(gps))
    }

    pub fn with_light_sensor(self, sensor: Arc<dyn LightSensor>) -> Self {
        self.with(CapabilityHandle::LightSensor(sensor))
    }

    pub fn with_thermometer(self, thermometer: Arc<dyn Thermometer>) -> Self {
        self.with(CapabilityHandle::Thermometer(thermometer))
    }

    pub fn with_barometer(self, barometer: Arc<dyn Barometer>) -> Self {
        self.with(CapabilityHandle::Barometer(barometer))
    }

    pub fn insert(&mut self, handle: CapabilityHandle) {
        self.entries.insert(handle.capability(), handle);
    }

    pub fn get(&self, capability: Capability) -> Option<&CapabilityHandle> {
        self.entries.get(&capability)
    }

    pub fn capabilities(&self) -> BTreeSet<Capability> {
        self.entries.keys().copied().collect()
    }

    /// Keep only the capabilities in `advertised`.
    pub fn restrict_to(&mut self, advertised: &BTreeSet<Capability>) {
        self.entries.retain(|capability, _| advertised.contains(capability));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GAINS: [GainValue; 2] = [
        GainValue { id: 0, multiplier: 1 },
        GainValue { id: 1, multiplier: 25 },
    ];

    #[test]
    fn test_resolve_known_option() {
        assert_eq!(resolve_option(&GAINS, 1).unwrap().multiplier, 25);
    }

    #[test]
    fn test_resolve_unknown_option() {
        assert_eq!(
            resolve_option(&GAINS, 7).unwrap_err(),
            DeviceError::UnsupportedOption { option: "gain", id: 7 }
        );
    }

    #[test]
    fn test_capability_wire_names() {
        assert_eq!(
            serde_json::to_string(&Capability::LedController).unwrap(),
            "\"LEDController\""
        );
        assert_eq!("gps".parse::<Capability>().unwrap(), Capability::Gps);
        assert!("Compass".parse::<Capability>().is_err());
        assert_eq!(Capability::Barometer.version(), Version::new(1, 0, 0));
    }

    #[test]
    fn test_led_mode_wire_names() {
        assert_eq!(serde_json::to_string(&LedMode::Infrared).unwrap(), "\"IR\"");
        assert_eq!(
            serde_json::from_str::<LedMode>("\"VIS\"").unwrap(),
            LedMode::Visible
        );
    }

    #[test]
    fn test_unit_conversions() {
        assert_eq!(celsius_to_fahrenheit(100.0), 212.0);
        assert_eq!(celsius_to_fahrenheit(-40.0), -40.0);
        assert!(pressure_altitude(SEA_LEVEL_PRESSURE_PA, SEA_LEVEL_PRESSURE_PA).abs() < 1e-3);
        let alt = pressure_altitude(89_874.6, SEA_LEVEL_PRESSURE_PA);
        assert!((alt - 1000.0).abs() < 5.0, "altitude was {}", alt);
    }

    #[test]
    fn test_option_tables_serialize_pascal_case() {
        let json = serde_json::to_value(IntegrationTime { id: 2, time_ms: 300 }).unwrap();
        assert_eq!(json, serde_json::json!({ "Id": 2, "TimeMs": 300 }));
    }
}
