use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use nvos_devices::{DeviceRegistry, LedController};

use super::{decode, reply, unknown_method, RpcService};
use crate::messages::{
    DeviceRequest, Empty, GetStateResponse, SetBrightnessRequest, SetModeRequest,
    SetPowerStateRequest,
};
use crate::status::Status;

const METHODS: &[&str] = &["GetState", "SetBrightness", "SetMode", "SetPowerState"];

pub struct LedControllerService {
    registry: Arc<DeviceRegistry>,
}

impl LedControllerService {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    async fn device(&self, address: &str) -> Result<Arc<dyn LedController>, Status> {
        Ok(self.registry.led(address).await?)
    }
}

#[async_trait]
impl RpcService for LedControllerService {
    fn name(&self) -> &'static str {
        "LEDController"
    }

    fn methods(&self) -> &'static [&'static str] {
        METHODS
    }

    async fn call(&self, method: &str, payload: Value) -> Result<Value, Status> {
        match method {
            "GetState" => {
                let request: DeviceRequest = decode(payload)?;
                let state = self.device(&request.address).await?.state().await?;
                reply(GetStateResponse::from(state))
            }
            "SetBrightness" => {
                let request: SetBrightnessRequest = decode(payload)?;
                self.device(&request.address)
                    .await?
                    .set_brightness(request.brightness)
                    .await?;
                reply(Empty {})
            }
            "SetMode" => {
                let request: SetModeRequest = decode(payload)?;
                self.device(&request.address)
                    .await?
                    .set_mode(request.mode)
                    .await?;
                reply(Empty {})
            }
            "SetPowerState" => {
                let request: SetPowerStateRequest = decode(payload)?;
                self.device(&request.address)
                    .await?
                    .set_power(request.powered_on)
                    .await?;
                reply(Empty {})
            }
            _ => Err(unknown_method(self.name(), method)),
        }
    }
}
