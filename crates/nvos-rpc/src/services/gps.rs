use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use nvos_devices::{DeviceRegistry, Gps};

use super::{decode, reply, unknown_method, RpcService};
use crate::messages::{
    DeviceRequest, GetAccuracyResponse, GetAltitudeResponse, GetFullReportResponse,
    GetHeadingResponse, GetLocationResponse, GetNumSatellitesResponse, GetSpeedResponse,
    HasFixResponse,
};
use crate::status::Status;

const METHODS: &[&str] = &[
    "GetLocation",
    "GetAltitude",
    "HasFix",
    "GetSpeed",
    "GetHeading",
    "GetNumSatellites",
    "GetFullReport",
    "GetVerticalAccuracy",
    "GetHorizontalAccuracy",
];

pub struct GpsService {
    registry: Arc<DeviceRegistry>,
}

impl GpsService {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    async fn device(&self, payload: Value) -> Result<Arc<dyn Gps>, Status> {
        let request: DeviceRequest = decode(payload)?;
        Ok(self.registry.gps(&request.address).await?)
    }
}

#[async_trait]
impl RpcService for GpsService {
    fn name(&self) -> &'static str {
        "GPS"
    }

    fn methods(&self) -> &'static [&'static str] {
        METHODS
    }

    async fn call(&self, method: &str, payload: Value) -> Result<Value, Status> {
        if !METHODS.contains(&method) {
            return Err(unknown_method(self.name(), method));
        }
        let gps = self.device(payload).await?;

        match method {
            "GetLocation" => {
                let point = gps.location().await?;
                reply(GetLocationResponse {
                    latitude: point.latitude,
                    longitude: point.longitude,
                })
            }
            "GetAltitude" => reply(GetAltitudeResponse {
                altitude: gps.altitude().await?,
            }),
            "HasFix" => reply(HasFixResponse {
                has_fix: gps.has_fix().await?,
            }),
            "GetSpeed" => reply(GetSpeedResponse {
                speed_over_ground: gps.speed().await?,
            }),
            "GetHeading" => reply(GetHeadingResponse {
                heading: gps.heading().await?,
            }),
            "GetNumSatellites" => reply(GetNumSatellitesResponse {
                count: gps.satellite_count().await?,
            }),
            "GetFullReport" => reply(GetFullReportResponse::from(gps.full_report().await?)),
            "GetVerticalAccuracy" => reply(GetAccuracyResponse {
                accuracy: gps.vertical_accuracy().await?,
            }),
            "GetHorizontalAccuracy" => reply(GetAccuracyResponse {
                accuracy: gps.horizontal_accuracy().await?,
            }),
            _ => Err(unknown_method(self.name(), method)),
        }
    }
}
