use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use nvos_devices::{DeviceRegistry, Thermometer};

use super::{decode, reply, unknown_method, RpcService};
use crate::messages::{
    DeviceRequest, Empty, GetGainResponse, GetSleepIntervalResponse, SetGainRequest,
    SetIntervalRequest, SupportedGains, SupportedSleepIntervals, ValueResponse,
};
use crate::status::Status;

const METHODS: &[&str] = &[
    "GetSupportedGains",
    "GetSupportedIntervals",
    "GetGain",
    "SetGain",
    "GetInterval",
    "SetInterval",
    "GetTemperatureCelsius",
    "GetTemperatureFahrenheit",
];

pub struct ThermometerService {
    registry: Arc<DeviceRegistry>,
}

impl ThermometerService {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    async fn device(&self, address: &str) -> Result<Arc<dyn Thermometer>, Status> {
        Ok(self.registry.thermometer(address).await?)
    }
}

#[async_trait]
impl RpcService for ThermometerService {
    fn name(&self) -> &'static str {
        "Thermometer"
    }

    fn methods(&self) -> &'static [&'static str] {
        METHODS
    }

    async fn call(&self, method: &str, payload: Value) -> Result<Value, Status> {
        match method {
            "SetGain" => {
                let request: SetGainRequest = decode(payload)?;
                self.device(&request.address)
                    .await?
                    .set_gain(request.gain_id)
                    .await?;
                reply(Empty {})
            }
            "SetInterval" => {
                let request: SetIntervalRequest = decode(payload)?;
                self.device(&request.address)
                    .await?
                    .set_interval(request.interval_id)
                    .await?;
                reply(Empty {})
            }
            _ if METHODS.contains(&method) => {
                let request: DeviceRequest = decode(payload)?;
                let thermometer = self.device(&request.address).await?;
                match method {
                    "GetSupportedGains" => reply(SupportedGains {
                        values: thermometer.supported_gains(),
                    }),
                    "GetSupportedIntervals" => reply(SupportedSleepIntervals {
                        values: thermometer.supported_intervals(),
                    }),
                    "GetGain" => reply(GetGainResponse {
                        gain_multiplier: thermometer.gain().await?.multiplier,
                    }),
                    "GetInterval" => reply(GetSleepIntervalResponse {
                        sleep_interval_ms: thermometer.interval().await?.time_ms,
                    }),
                    "GetTemperatureCelsius" => reply(ValueResponse {
                        value: thermometer.temperature_celsius().await?,
                    }),
                    "GetTemperatureFahrenheit" => reply(ValueResponse {
                        value: thermometer.temperature_fahrenheit().await?,
                    }),
                    _ => Err(unknown_method(self.name(), method)),
                }
            }
            _ => Err(unknown_method(self.name(), method)),
        }
    }
}
