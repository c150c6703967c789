use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use nvos_devices::{Capability, DeviceRegistry};

use super::{reply, unknown_method, RpcService};
use crate::messages::{
    BusController, CapabilityDescriptor, Device, ListCapabilitiesResponse, ListControllersResponse,
    ListDevicesResponse,
};
use crate::status::Status;

const METHODS: &[&str] = &["ListDevices", "ListControllers", "ListCapabilities"];

/// Read-only discovery over the registry.
pub struct DeviceReflectionService {
    registry: Arc<DeviceRegistry>,
}

impl DeviceReflectionService {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RpcService for DeviceReflectionService {
    fn name(&self) -> &'static str {
        "DeviceReflection"
    }

    fn methods(&self) -> &'static [&'static str] {
        METHODS
    }

    async fn call(&self, method: &str, _payload: Value) -> Result<Value, Status> {
        match method {
            "ListDevices" => {
                let devices: Vec<Device> = self
                    .registry
                    .list_devices()
                    .await
                    .iter()
                    .map(Device::from)
                    .collect();
                reply(ListDevicesResponse {
                    count: devices.len() as u32,
                    devices,
                })
            }
            "ListControllers" => {
                let controllers: Vec<BusController> = self
                    .registry
                    .list_controllers()
                    .await
                    .iter()
                    .map(BusController::from)
                    .collect();
                reply(ListControllersResponse {
                    count: controllers.len() as u32,
                    controllers,
                })
            }
            "ListCapabilities" => {
                let capabilities: Vec<CapabilityDescriptor> = Capability::ALL
                    .into_iter()
                    .map(|capability| CapabilityDescriptor {
                        name: capability,
                        version: capability.version().to_string(),
                    })
                    .collect();
                reply(ListCapabilitiesResponse {
                    count: capabilities.len() as u32,
                    capabilities,
                })
            }
            _ => Err(unknown_method(self.name(), method)),
        }
    }
}
