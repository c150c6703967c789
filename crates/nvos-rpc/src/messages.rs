//! Request and response messages.
//!
//! Field names are part of the wire contract and are serialized in
//! PascalCase. Every request names its target device by `Address`.

use serde::{Deserialize, Serialize};

use nvos_devices::{
    BusKind, Capability, ControllerInfo, DeviceInfo, GainValue, GpsReport, IntegrationTime,
    LedMode, LedState, LightChannel, SleepInterval,
};

/// Acknowledgment of a mutator, and the request of address-less calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// Request that only names the target device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceRequest {
    pub address: String,
}

/// A single reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ValueResponse<T> {
    pub value: T,
}

/// An option table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ValuesResponse<T> {
    pub values: Vec<T>,
}

// ========== Shared sensor settings ==========

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SetGainRequest {
    pub address: String,
    pub gain_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SetIntervalRequest {
    pub address: String,
    pub interval_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetGainResponse {
    pub gain_multiplier: u32,
}

pub type SupportedGains = ValuesResponse<GainValue>;
pub type SupportedIntegrationTimes = ValuesResponse<IntegrationTime>;
pub type SupportedSleepIntervals = ValuesResponse<SleepInterval>;
pub type SupportedChannels = ValuesResponse<LightChannel>;

// ========== GPS ==========

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetLocationResponse {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetAltitudeResponse {
    pub altitude: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HasFixResponse {
    pub has_fix: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetSpeedResponse {
    pub speed_over_ground: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetHeadingResponse {
    pub heading: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetNumSatellitesResponse {
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetAccuracyResponse {
    pub accuracy: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetFullReportResponse {
    pub has_fix: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f32,
    pub speed_over_ground: f32,
    pub heading: f32,
    pub satellite_count: u32,
    pub vertical_accuracy: f32,
    pub horizontal_accuracy: f32,
}

impl From<GpsReport> for GetFullReportResponse {
    fn from(report: GpsReport) -> Self {
        Self {
            has_fix: report.has_fix,
            latitude: report.latitude,
            longitude: report.longitude,
            altitude: report.altitude,
            speed_over_ground: report.speed_over_ground,
            heading: report.heading,
            satellite_count: report.satellite_count,
            vertical_accuracy: report.vertical_accuracy,
            horizontal_accuracy: report.horizontal_accuracy,
        }
    }
}

// ========== LED controller ==========

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetStateResponse {
    pub powered_on: bool,
    pub brightness: f32,
    pub mode: LedMode,
}

impl From<LedState> for GetStateResponse {
    fn from(state: LedState) -> Self {
        Self {
            powered_on: state.powered_on,
            brightness: state.brightness,
            mode: state.mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SetBrightnessRequest {
    pub address: String,
    pub brightness: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SetModeRequest {
    pub address: String,
    pub mode: LedMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SetPowerStateRequest {
    pub address: String,
    pub powered_on: bool,
}

// ========== Light sensor ==========

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetIntegrationTimeResponse {
    pub integration_time_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AutoGainEnabledResponse {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SetAutoGainEnabledRequest {
    pub address: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetLuminosityRequest {
    pub address: String,
    pub channel_id: u32,
}

// ========== Thermometer / barometer ==========

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetSleepIntervalResponse {
    pub sleep_interval_ms: u32,
}

// ========== Reflection ==========

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Device {
    pub address: String,
    pub capabilities: Vec<Capability>,
    pub device_name: String,
    pub driver_name: String,
    pub controller: String,
    pub is_running: bool,
}

impl From<&DeviceInfo> for Device {
    fn from(info: &DeviceInfo) -> Self {
        Self {
            address: info.address.clone(),
            capabilities: info.capabilities.iter().copied().collect(),
            device_name: info.device_name.clone(),
            driver_name: info.driver_name.clone(),
            controller: info.controller.clone(),
            is_running: info.is_running,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BusController {
    pub name: String,
    pub kind: BusKind,
}

impl From<&ControllerInfo> for BusController {
    fn from(info: &ControllerInfo) -> Self {
        Self {
            name: info.name.clone(),
            kind: info.kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListDevicesResponse {
    pub count: u32,
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListControllersResponse {
    pub count: u32,
    pub controllers: Vec<BusController>,
}

/// A capability contract and its version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CapabilityDescriptor {
    pub name: Capability,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListCapabilitiesResponse {
    pub count: u32,
    pub capabilities: Vec<CapabilityDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_names_are_pascal_case() {
        let request: SetGainRequest =
            serde_json::from_value(json!({ "Address": "light", "GainId": 2 })).unwrap();
        assert_eq!(request.gain_id, 2);

        let value = serde_json::to_value(GetSpeedResponse {
            speed_over_ground: 1.5,
        })
        .unwrap();
        assert_eq!(value, json!({ "SpeedOverGround": 1.5 }));
    }

    #[test]
    fn test_led_mode_wire_names() {
        let request: SetModeRequest =
            serde_json::from_value(json!({ "Address": "led", "Mode": "IR" })).unwrap();
        assert_eq!(request.mode, LedMode::Infrared);
        assert!(serde_json::from_value::<SetModeRequest>(json!({ "Address": "led", "Mode": "UV" }))
            .is_err());
    }

    #[test]
    fn test_empty_is_an_empty_object() {
        assert_eq!(serde_json::to_value(Empty {}).unwrap(), json!({}));
    }
}
