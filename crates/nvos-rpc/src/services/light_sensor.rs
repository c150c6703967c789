use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use nvos_devices::{DeviceRegistry, LightSensor};

use super::{decode, reply, unknown_method, RpcService};
use crate::messages::{
    AutoGainEnabledResponse, DeviceRequest, Empty, GetGainResponse, GetIntegrationTimeResponse,
    GetLuminosityRequest, SetAutoGainEnabledRequest, SetGainRequest, SetIntervalRequest,
    SupportedChannels, SupportedGains, SupportedIntegrationTimes, ValueResponse,
};
use crate::status::Status;

const METHODS: &[&str] = &[
    "GetSupportedGains",
    "GetSupportedIntervals",
    "GetSupportedChannels",
    "GetGain",
    "SetGain",
    "GetInterval",
    "SetInterval",
    "GetAutoGainEnabled",
    "SetAutoGainEnabled",
    "GetLuminosity",
    "GetIlluminance",
];

pub struct LightSensorService {
    registry: Arc<DeviceRegistry>,
}

impl LightSensorService {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    async fn device(&self, address: &str) -> Result<Arc<dyn LightSensor>, Status> {
        Ok(self.registry.light_sensor(address).await?)
    }
}

#[async_trait]
impl RpcService for LightSensorService {
    fn name(&self) -> &'static str {
        "LightSensor"
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
            "SetAutoGainEnabled" => {
                let request: SetAutoGainEnabledRequest = decode(payload)?;
                self.device(&request.address)
                    .await?
                    .set_auto_gain(request.enabled)
                    .await?;
                reply(Empty {})
            }
            "GetLuminosity" => {
                let request: GetLuminosityRequest = decode(payload)?;
                let value = self
                    .device(&request.address)
                    .await?
                    .luminosity(request.channel_id)
                    .await?;
                reply(ValueResponse { value })
            }
            _ if METHODS.contains(&method) => {
                let request: DeviceRequest = decode(payload)?;
                let sensor = self.device(&request.address).await?;
                match method {
                    "GetSupportedGains" => reply(SupportedGains {
                        values: sensor.supported_gains(),
                    }),
                    "GetSupportedIntervals" => reply(SupportedIntegrationTimes {
                        values: sensor.supported_intervals(),
                    }),
                    "GetSupportedChannels" => reply(SupportedChannels {
                        values: sensor.supported_channels(),
                    }),
                    "GetGain" => reply(GetGainResponse {
                        gain_multiplier: sensor.gain().await?.multiplier,
                    }),
                    "GetInterval" => reply(GetIntegrationTimeResponse {
                        integration_time_ms: sensor.interval().await?.time_ms,
                    }),
                    "GetAutoGainEnabled" => reply(AutoGainEnabledResponse {
                        enabled: sensor.auto_gain_enabled().await?,
                    }),
                    "GetIlluminance" => reply(ValueResponse {
                        value: sensor.illuminance().await?,
                    }),
                    _ => Err(unknown_method(self.name(), method)),
                }
            }
            _ => Err(unknown_method(self.name(), method)),
        }
    }
}
