//! Routes `(service, method, payload)` calls to services.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use nvos_devices::DeviceRegistry;

use crate::services::{
    BarometerService, DeviceReflectionService, GpsService, HeartbeatService, LedControllerService,
    LightSensorService, RpcService, ThermometerService,
};
use crate::status::{Code, Status};

/// Call-in surface for the transport layer.
#[derive(Default)]
pub struct RpcDispatcher {
    services: BTreeMap<&'static str, Arc<dyn RpcService>>,
}

impl RpcDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher serving every capability service, reflection and heartbeat.
    pub fn with_device_services(registry: Arc<DeviceRegistry>) -> Self {
        let mut dispatcher = Self::new();
        let services: [Arc<dyn RpcService>; 7] = [
            Arc::new(GpsService::new(registry.clone())),
            Arc::new(LedControllerService::new(registry.clone())),
            Arc::new(LightSensorService::new(registry.clone())),
            Arc::new(ThermometerService::new(registry.clone())),
            Arc::new(BarometerService::new(registry.clone())),
            Arc::new(DeviceReflectionService::new(registry)),
            Arc::new(HeartbeatService),
        ];
        for service in services {
            dispatcher.services.insert(service.name(), service);
        }
        dispatcher
    }

    /// Add a service. Names are unique.
    pub fn register(&mut self, service: Arc<dyn RpcService>) -> Result<(), Status> {
        if self.services.contains_key(service.name()) {
            return Err(Status::new(
                Code::AlreadyExists,
                nvos_core::ErrorKind::Client,
                format!("service '{}' is already registered", service.name()),
            ));
        }
        self.services.insert(service.name(), service);
        Ok(())
    }

    /// Service names with their methods.
    pub fn services(&self) -> impl Iterator<Item = (&'static str, &'static [&'static str])> + '_ {
        self.services
            .values()
            .map(|service| (service.name(), service.methods()))
    }

    pub async fn call(&self, service: &str, method: &str, payload: Value) -> Result<Value, Status> {
        let Some(target) = self.services.get(service) else {
            return Err(Status::unimplemented(format!("unknown service '{}'", service)));
        };
        if !target.methods().contains(&method) {
            return Err(Status::unimplemented(format!(
                "service '{}' has no method '{}'",
                service, method
            )));
        }

        let started = Instant::now();
        let result = target.call(method, payload).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => tracing::debug!(service, method, elapsed_ms, "rpc call completed"),
            Err(status) if status.code == Code::Internal => tracing::warn!(
                service,
                method,
                elapsed_ms,
                code = %status.code,
                kind = %status.kind,
                error = %status.message,
                "rpc call failed"
            ),
            Err(status) => tracing::debug!(
                service,
                method,
                elapsed_ms,
                code = %status.code,
                error = %status.message,
                "rpc call rejected"
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dispatcher() -> RpcDispatcher {
        RpcDispatcher::with_device_services(Arc::new(DeviceRegistry::new()))
    }

    #[tokio::test]
    async fn test_ping() {
        let reply = dispatcher().call("Heartbeat", "Ping", Value::Null).await;
        assert_eq!(reply.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn test_unknown_service_and_method() {
        let dispatcher = dispatcher();
        let status = dispatcher
            .call("Compass", "GetHeading", json!({ "Address": "c" }))
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::Unimplemented);

        // Checked before the address is resolved
        let status = dispatcher
            .call("GPS", "GetDrift", json!({ "Address": "nowhere" }))
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::Unimplemented);
    }

    #[tokio::test]
    async fn test_malformed_payload() {
        let status = dispatcher()
            .call("GPS", "HasFix", json!({ "Addr": "uart0:gps" }))
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::InvalidArgument);
        assert!(status.message.starts_with("malformed request"));
    }

    #[tokio::test]
    async fn test_unknown_address_is_not_found() {
        let status = dispatcher()
            .call("GPS", "HasFix", json!({ "Address": "uart0:gps" }))
            .await
            .unwrap_err();
        assert_eq!(status.code, Code::NotFound);
    }

    #[test]
    fn test_duplicate_service_name() {
        let mut dispatcher = dispatcher();
        assert_eq!(dispatcher.services().count(), 7);
        let status = dispatcher.register(Arc::new(HeartbeatService)).unwrap_err();
        assert_eq!(status.code, Code::AlreadyExists);
    }
}
