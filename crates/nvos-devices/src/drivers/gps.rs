//! NMEA GPS receiver on a serial port.
//!
//! A background worker drains the port every polling interval. Queries also
//! drain it first, so answers always reflect every byte received so far.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::bus::{BusKind, ChannelSetting, Parity};
use crate::capability::{Capability, CapabilityTable, GeoPoint, Gps, GpsReport};
use crate::driver::{parse_config, DeviceDriver, DriverContext, DriverFactory, DriverInstance};
use crate::drivers::nmea::{NavState, NmeaReader};
use crate::drivers::BusLink;
use crate::error::DeviceError;

pub const DRIVER_NAME: &str = "gps_uart";

/// Dilution of precision assumed when the receiver has not reported one.
pub const MAX_PRECISION_DILUTION: f32 = 20.0;

const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 256;
/// Upper bound on chunks drained per pump, so a chatty port cannot stall a query.
const MAX_CHUNKS_PER_PUMP: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsConfig {
    pub port: u32,
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub polling_interval_ms: u64,
    /// Receiver accuracy at a dilution of precision of 1.0, in meters.
    pub peak_accuracy_meters: f32,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            port: 0,
            baud_rate: 115_200,
            parity: Parity::None,
            data_bits: 8,
            stop_bits: 1,
            polling_interval_ms: 1000,
            peak_accuracy_meters: 3.0,
        }
    }
}

impl GpsConfig {
    pub fn validate(&self) -> Result<(), DeviceError> {
        if self.baud_rate == 0 {
            return Err(DeviceError::InvalidConfig("baud_rate cannot be 0".to_string()));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(DeviceError::InvalidConfig(format!(
                "data_bits must be between 5 and 8, got {}",
                self.data_bits
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(DeviceError::InvalidConfig(format!(
                "stop_bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        if self.polling_interval_ms == 0 {
            return Err(DeviceError::InvalidConfig(
                "polling_interval_ms cannot be 0".to_string(),
            ));
        }
        if self.peak_accuracy_meters.is_nan() || self.peak_accuracy_meters <= 0.0 {
            return Err(DeviceError::InvalidConfig(
                "peak_accuracy_meters must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn serial_setting(&self) -> ChannelSetting {
        ChannelSetting::Serial {
            baud_rate: self.baud_rate,
            parity: self.parity,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
        }
    }

    fn accuracy(&self, dop: Option<f32>) -> f32 {
        self.peak_accuracy_meters * dop.unwrap_or(MAX_PRECISION_DILUTION)
    }
}

/// State shared with the polling worker.
struct GpsShared {
    address: parking_lot::Mutex<String>,
    /// Held across read and parse so chunks are fed in order.
    link: Mutex<Option<BusLink>>,
    reader: parking_lot::Mutex<NmeaReader>,
}

impl GpsShared {
    /// Drain pending bytes from the port into the parser.
    async fn pump(&self) -> Result<usize, DeviceError> {
        let link = self.link.lock().await;
        let Some(link) = link.as_ref() else {
            return Err(DeviceError::NotRunning(self.address.lock().clone()));
        };

        let mut applied = 0;
        for _ in 0..MAX_CHUNKS_PER_PUMP {
            let chunk = link.read(READ_CHUNK).await?;
            if chunk.is_empty() {
                break;
            }
            applied += self.reader.lock().feed(&chunk);
        }
        Ok(applied)
    }
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct GpsDriver {
    config: GpsConfig,
    shared: Arc<GpsShared>,
    worker: Mutex<Option<Worker>>,
    running: AtomicBool,
}

impl GpsDriver {
    pub fn new(config: GpsConfig) -> Result<Self, DeviceError> {
        config.validate()?;
        Ok(Self {
            config,
            shared: Arc::new(GpsShared {
                address: parking_lot::Mutex::new(String::new()),
                link: Mutex::new(None),
                reader: parking_lot::Mutex::new(NmeaReader::new()),
            }),
            worker: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Pump the port, then return the current navigation state.
    async fn snapshot(&self) -> Result<NavState, DeviceError> {
        self.shared.pump().await?;
        let state = self.shared.reader.lock().state().clone();
        Ok(state)
    }

    fn spawn_worker(&self) -> Worker {
        let shared = self.shared.clone();
        let period = Duration::from_millis(self.config.polling_interval_ms);
        let (shutdown, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = shared.pump().await {
                            tracing::debug!(error = %e, "GPS poll failed");
                        }
                    }
                }
            }
        });

        Worker { shutdown, handle }
    }
}

fn missing(what: &str) -> DeviceError {
    DeviceError::Hardware(format!("no {} data received yet", what))
}

#[async_trait]
impl DeviceDriver for GpsDriver {
    fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn device_name(&self) -> String {
        "NMEA GPS".to_string()
    }

    async fn start(&self, ctx: &DriverContext) -> Result<(), DeviceError> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Err(DeviceError::Internal(format!(
                "GPS at '{}' started twice",
                ctx.address()
            )));
        }
        *self.shared.address.lock() = ctx.address().to_string();
        // A restarted receiver must earn a fresh fix
        *self.shared.reader.lock() = NmeaReader::new();

        let controller = ctx.controller().clone();
        let lease = ctx.acquire(&controller, self.config.port).await?;
        let link = BusLink::new(controller, lease, ctx.retry());
        link.configure(&self.config.serial_setting()).await?;

        *self.shared.link.lock().await = Some(link);
        *worker = Some(self.spawn_worker());
        self.running.store(true, Ordering::SeqCst);

        tracing::debug!(address = ctx.address(), port = self.config.port, "GPS worker started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        self.running.store(false, Ordering::SeqCst);

        if let Some(Worker {
            shutdown,
            mut handle,
        }) = self.worker.lock().await.take()
        {
            let _ = shutdown.send(true);
            if tokio::time::timeout(WORKER_SHUTDOWN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!("GPS worker did not stop in time, aborting");
                handle.abort();
            }
            tracing::debug!(address = %self.shared.address.lock(), "GPS worker stopped");
        }

        if let Some(link) = self.shared.link.lock().await.take() {
            link.release().await;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Gps for GpsDriver {
    async fn has_fix(&self) -> Result<bool, DeviceError> {
        Ok(self.snapshot().await?.has_fix())
    }

    async fn location(&self) -> Result<GeoPoint, DeviceError> {
        let state = self.snapshot().await?;
        match (state.latitude, state.longitude) {
            (Some(latitude), Some(longitude)) => Ok(GeoPoint {
                latitude,
                longitude,
            }),
            _ => Err(missing("position")),
        }
    }

    async fn altitude(&self) -> Result<f32, DeviceError> {
        self.snapshot().await?.altitude.ok_or_else(|| missing("altitude"))
    }

    async fn speed(&self) -> Result<f32, DeviceError> {
        self.snapshot()
            .await?
            .speed_knots
            .ok_or_else(|| missing("speed"))
    }

    async fn heading(&self) -> Result<f32, DeviceError> {
        self.snapshot().await?.course.ok_or_else(|| missing("heading"))
    }

    async fn satellite_count(&self) -> Result<u32, DeviceError> {
        Ok(self.snapshot().await?.satellite_count())
    }

    async fn vertical_accuracy(&self) -> Result<f32, DeviceError> {
        Ok(self.config.accuracy(self.snapshot().await?.vdop))
    }

    async fn horizontal_accuracy(&self) -> Result<f32, DeviceError> {
        Ok(self.config.accuracy(self.snapshot().await?.hdop))
    }

    async fn full_report(&self) -> Result<GpsReport, DeviceError> {
        let state = self.snapshot().await?;
        Ok(GpsReport {
            has_fix: state.has_fix(),
            latitude: state.latitude.unwrap_or(0.0),
            longitude: state.longitude.unwrap_or(0.0),
            altitude: state.altitude.unwrap_or(0.0),
            speed_over_ground: state.speed_knots.unwrap_or(0.0),
            heading: state.course.unwrap_or(0.0),
            satellite_count: state.satellite_count(),
            vertical_accuracy: self.config.accuracy(state.vdop),
            horizontal_accuracy: self.config.accuracy(state.hdop),
        })
    }
}

pub struct GpsUartFactory;

impl DriverFactory for GpsUartFactory {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn description(&self) -> &'static str {
        "NMEA-0183 GPS receiver on a UART port"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::Gps]
    }

    fn supported_buses(&self) -> &'static [BusKind] {
        &[BusKind::Uart]
    }

    fn create(&self, config: &serde_json::Value) -> Result<DriverInstance, DeviceError> {
        let driver = Arc::new(GpsDriver::new(parse_config(config)?)?);
        Ok(DriverInstance {
            capabilities: CapabilityTable::new().with_gps(driver.clone()),
            driver,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accuracy_uses_max_dilution_when_unknown() {
        let config = GpsConfig::default();
        assert_eq!(config.accuracy(None), 60.0);
        assert_eq!(config.accuracy(Some(1.5)), 4.5);
    }

    #[test]
    fn test_config_validation() {
        assert!(GpsConfig::default().validate().is_ok());
        for bad in [
            json!({ "data_bits": 9 }),
            json!({ "stop_bits": 3 }),
            json!({ "polling_interval_ms": 0 }),
            json!({ "peak_accuracy_meters": -1.0 }),
        ] {
            let config: GpsConfig = serde_json::from_value(bad.clone()).unwrap();
            assert!(config.validate().is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_factory_rejects_unknown_parity() {
        let result = GpsUartFactory.create(&json!({ "parity": "mark" }));
        assert!(matches!(result, Err(DeviceError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_queries_before_start_fail() {
        let driver = GpsDriver::new(GpsConfig::default()).unwrap();
        assert!(matches!(
            driver.has_fix().await,
            Err(DeviceError::NotRunning(_))
        ));
    }
}
