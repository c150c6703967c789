use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use nvos_devices::{Barometer, DeviceRegistry};

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
    "GetPressure",
    "GetAltitude",
];

pub struct BarometerService {
    registry: Arc<DeviceRegistry>,
}

impl BarometerService {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    async fn device(&self, address: &str) -> Result<Arc<dyn Barometer>, Status> {
        Ok(self.registry.barometer(address).await?)
    }
}

#[async_trait]
impl RpcService for BarometerService {
    fn name(&self) -> &'static str {
        "Barometer"
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
                let barometer = self.device(&request.address).await?;
                match method {
                    "GetSupportedGains" => reply(SupportedGains {
                        values: barometer.supported_gains(),
                    }),
                    "GetSupportedIntervals" => reply(SupportedSleepIntervals {
                        values: barometer.supported_intervals(),
                    }),
                    "GetGain" => reply(GetGainResponse {
                        gain_multiplier: barometer.gain().await?.multiplier,
                    }),
                    "GetInterval" => reply(GetSleepIntervalResponse {
                        sleep_interval_ms: barometer.interval().await?.time_ms,
                    }),
                    // Pa
                    "GetPressure" => reply(ValueResponse {
                        value: barometer.pressure().await?,
                    }),
                    "GetAltitude" => reply(ValueResponse {
                        value: barometer.altitude().await?,
                    }),
                    _ => Err(unknown_method(self.name(), method)),
                }
            }
            _ => Err(unknown_method(self.name(), method)),
        }
    }
}
