//! Capability services.
//!
//! Each service decodes the request for a method, resolves the target
//! device through the registry and calls the capability implementation.

pub mod barometer;
pub mod gps;
pub mod heartbeat;
pub mod led;
pub mod light_sensor;
pub mod reflection;
pub mod thermometer;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::status::Status;

pub use barometer::BarometerService;
pub use gps::GpsService;
pub use heartbeat::HeartbeatService;
pub use led::LedControllerService;
pub use light_sensor::LightSensorService;
pub use reflection::DeviceReflectionService;
pub use thermometer::ThermometerService;

/// One named RPC service.
#[async_trait]
pub trait RpcService: Send + Sync {
    /// Service name on the wire, e.g. `GPS`.
    fn name(&self) -> &'static str;

    fn methods(&self) -> &'static [&'static str];

    async fn call(&self, method: &str, payload: Value) -> Result<Value, Status>;
}

/// Decode a request payload. A missing payload reads as an empty object.
pub(crate) fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, Status> {
    let payload = if payload.is_null() {
        Value::Object(Default::default())
    } else {
        payload
    };
    serde_json::from_value(payload)
        .map_err(|e| Status::invalid_argument(format!("malformed request: {}", e)))
}

pub(crate) fn reply<T: Serialize>(message: T) -> Result<Value, Status> {
    serde_json::to_value(message)
        .map_err(|e| Status::internal(format!("failed to encode response: {}", e)))
}

pub(crate) fn unknown_method(service: &str, method: &str) -> Status {
    Status::unimplemented(format!("service '{}' has no method '{}'", service, method))
}
