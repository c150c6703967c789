//! BMP280 temperature and pressure sensor.
//!
//! One driver instance serves both the Thermometer and Barometer
//! capabilities. Each measurement has its own oversampling ("gain"); the
//! standby interval between measurements is shared.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::bus::BusKind;
use crate::capability::{
    resolve_option, Barometer, Capability, CapabilityTable, GainValue, SleepInterval,
    Thermometer,
};
use crate::driver::{parse_config, DeviceDriver, DriverContext, DriverFactory, DriverInstance};
use crate::drivers::BusLink;
use crate::error::DeviceError;

pub const DRIVER_NAME: &str = "bmp280";

pub const DEFAULT_I2C_ADDR: u32 = 0x76;
const CHIP_ID: u8 = 0x58;

const REGISTER_CALIB0: u8 = 0x88;
const CALIB_DATA_LEN: usize = 24;
const REGISTER_ID: u8 = 0xD0;
const REGISTER_STATUS: u8 = 0xF3;
const REGISTER_CTRL_MEAS: u8 = 0xF4;
const REGISTER_CONFIG: u8 = 0xF5;
const REGISTER_PRESS_MSB: u8 = 0xF7;

/// measuring | im_update
const STATUS_BUSY_MASK: u8 = 0x09;
const MODE_NORMAL: u8 = 0x03;
const MODE_SLEEP: u8 = 0x00;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Oversampling settings. Ids are the register codes.
pub const GAINS: [GainValue; 5] = [
    GainValue { id: 1, multiplier: 1 },
    GainValue { id: 2, multiplier: 2 },
    GainValue { id: 3, multiplier: 4 },
    GainValue { id: 4, multiplier: 8 },
    GainValue { id: 5, multiplier: 16 },
];

/// Standby times. Ids are the register codes; 0.5 ms is reported as 1 ms.
pub const STANDBY_TIMES: [SleepInterval; 8] = [
    SleepInterval { id: 0, time_ms: 1 },
    SleepInterval { id: 1, time_ms: 63 },
    SleepInterval { id: 2, time_ms: 125 },
    SleepInterval { id: 3, time_ms: 250 },
    SleepInterval { id: 4, time_ms: 500 },
    SleepInterval { id: 5, time_ms: 1000 },
    SleepInterval { id: 6, time_ms: 2000 },
    SleepInterval { id: 7, time_ms: 4000 },
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bmp280Config {
    pub address: u32,
    pub temperature_gain_id: u32,
    pub pressure_gain_id: u32,
    pub standby_id: u32,
    /// How long to wait for the chip to finish its power-on copy of calibration data.
    pub ready_timeout_ms: u64,
}

impl Default for Bmp280Config {
    fn default() -> Self {
        Self {
            address: DEFAULT_I2C_ADDR,
            temperature_gain_id: 1,
            pressure_gain_id: 3,
            standby_id: 1,
            ready_timeout_ms: 100,
        }
    }
}

/// Factory trimming values, datasheet names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_snake_case)]
pub struct Calibration {
    pub dig_T1: u16,
    pub dig_T2: i16,
    pub dig_T3: i16,
    pub dig_P1: u16,
    pub dig_P2: i16,
    pub dig_P3: i16,
    pub dig_P4: i16,
    pub dig_P5: i16,
    pub dig_P6: i16,
    pub dig_P7: i16,
    pub dig_P8: i16,
    pub dig_P9: i16,
}

impl Calibration {
    pub fn from_bytes(buf: &[u8; CALIB_DATA_LEN]) -> Self {
        let u = |i: usize| u16::from_le_bytes([buf[i], buf[i + 1]]);
        let s = |i: usize| i16::from_le_bytes([buf[i], buf[i + 1]]);
        Self {
            dig_T1: u(0),
            dig_T2: s(2),
            dig_T3: s(4),
            dig_P1: u(6),
            dig_P2: s(8),
            dig_P3: s(10),
            dig_P4: s(12),
            dig_P5: s(14),
            dig_P6: s(16),
            dig_P7: s(18),
            dig_P8: s(20),
            dig_P9: s(22),
        }
    }

    /// Temperature in °C and pressure in Pa from raw 20-bit ADC values.
    pub fn compensate(&self, adc_t: i32, adc_p: i32) -> (f32, f32) {
        let t1 = self.dig_T1 as i32;
        let var1 = (((adc_t >> 3) - (t1 << 1)) * self.dig_T2 as i32) >> 11;
        let var2 = (((((adc_t >> 4) - t1) * ((adc_t >> 4) - t1)) >> 12) * self.dig_T3 as i32) >> 14;
        let t_fine = var1 + var2;
        let centi_celsius = (t_fine * 5 + 128) >> 8;

        let mut var1 = t_fine as i64 - 128_000;
        let mut var2 = var1 * var1 * self.dig_P6 as i64;
        var2 += (var1 * self.dig_P5 as i64) << 17;
        var2 += (self.dig_P4 as i64) << 35;
        var1 = ((var1 * var1 * self.dig_P3 as i64) >> 8) + ((var1 * self.dig_P2 as i64) << 12);
        var1 = (((1i64 << 47) + var1) * self.dig_P1 as i64) >> 33;

        let pressure = if var1 == 0 {
            0.0
        } else {
            let mut p = 1_048_576 - adc_p as i64;
            p = (((p << 31) - var2) * 3125) / var1;
            let var1 = (self.dig_P9 as i64 * (p >> 13) * (p >> 13)) >> 25;
            let var2 = (self.dig_P8 as i64 * p) >> 19;
            p = ((p + var1 + var2) >> 8) + ((self.dig_P7 as i64) << 4);
            p as f32 / 256.0
        };

        (centi_celsius as f32 / 100.0, pressure)
    }
}

fn raw_20bit(bytes: &[u8]) -> i32 {
    ((bytes[0] as i32) << 12) | ((bytes[1] as i32) << 4) | (bytes[2] as i32 >> 4)
}

struct BmpInner {
    address: String,
    link: Option<BusLink>,
    calibration: Option<Calibration>,
    temperature_gain: GainValue,
    pressure_gain: GainValue,
    standby: SleepInterval,
}

impl BmpInner {
    fn link(&self) -> Result<&BusLink, DeviceError> {
        self.link
            .as_ref()
            .ok_or_else(|| DeviceError::NotRunning(self.address.clone()))
    }

    fn ctrl_meas(&self, temperature: GainValue, pressure: GainValue) -> u8 {
        ((temperature.id as u8) << 5) | ((pressure.id as u8) << 2) | MODE_NORMAL
    }

    async fn write_ctrl_meas(&self, temperature: GainValue, pressure: GainValue) -> Result<(), DeviceError> {
        self.link()?
            .write_register(REGISTER_CTRL_MEAS, &[self.ctrl_meas(temperature, pressure)])
            .await
    }

    async fn write_standby(&self, standby: SleepInterval) -> Result<(), DeviceError> {
        self.link()?
            .write_register(REGISTER_CONFIG, &[(standby.id as u8) << 5])
            .await
    }

    async fn measure(&self) -> Result<(f32, f32), DeviceError> {
        let calibration = self.calibration.ok_or_else(|| {
            DeviceError::Internal(format!("calibration missing for '{}'", self.address))
        })?;
        let raw = self.link()?.read_register(REGISTER_PRESS_MSB, 6).await?;
        let adc_p = raw_20bit(&raw[0..3]);
        let adc_t = raw_20bit(&raw[3..6]);
        Ok(calibration.compensate(adc_t, adc_p))
    }
}

async fn wait_ready(link: &BusLink, timeout: Duration) -> Result<(), DeviceError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = link.read_register(REGISTER_STATUS, 1).await?[0];
        if status & STATUS_BUSY_MASK == 0 {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(DeviceError::Timeout {
                operation: "waiting for BMP280 to become ready".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

pub struct Bmp280Driver {
    config: Bmp280Config,
    inner: Mutex<BmpInner>,
    running: AtomicBool,
}

impl Bmp280Driver {
    pub fn new(config: Bmp280Config) -> Result<Self, DeviceError> {
        let invalid = |e: DeviceError| DeviceError::InvalidConfig(e.to_string());
        let temperature_gain = resolve_option(&GAINS, config.temperature_gain_id).map_err(invalid)?;
        let pressure_gain = resolve_option(&GAINS, config.pressure_gain_id).map_err(invalid)?;
        let standby = resolve_option(&STANDBY_TIMES, config.standby_id).map_err(invalid)?;

        Ok(Self {
            inner: Mutex::new(BmpInner {
                address: String::new(),
                link: None,
                calibration: None,
                temperature_gain,
                pressure_gain,
                standby,
            }),
            config,
            running: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl DeviceDriver for Bmp280Driver {
    fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn device_name(&self) -> String {
        "BMP280 Barometric Sensor".to_string()
    }

    async fn start(&self, ctx: &DriverContext) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().await;
        if inner.link.is_some() {
            return Err(DeviceError::Internal(format!(
                "BMP280 at '{}' started twice",
                ctx.address()
            )));
        }
        inner.address = ctx.address().to_string();

        let controller = ctx.controller().clone();
        let lease = ctx.acquire(&controller, self.config.address).await?;
        let link = BusLink::new(controller, lease, ctx.retry());

        let chip_id = link.read_register(REGISTER_ID, 1).await?[0];
        if chip_id != CHIP_ID {
            return Err(DeviceError::Hardware(format!(
                "address {:#04x} reported chip id {:#04x}, expected {:#04x}",
                self.config.address, chip_id, CHIP_ID
            )));
        }

        wait_ready(&link, Duration::from_millis(self.config.ready_timeout_ms)).await?;

        let raw = link.read_register(REGISTER_CALIB0, CALIB_DATA_LEN).await?;
        let raw: [u8; CALIB_DATA_LEN] = raw
            .try_into()
            .map_err(|_| DeviceError::Hardware("short calibration read".to_string()))?;
        inner.calibration = Some(Calibration::from_bytes(&raw));
        inner.link = Some(link);

        let (standby, t_gain, p_gain) = (inner.standby, inner.temperature_gain, inner.pressure_gain);
        if let Err(e) = inner.write_standby(standby).await {
            tracing::warn!(address = ctx.address(), error = %e, "failed to set standby time");
        }
        if let Err(e) = inner.write_ctrl_meas(t_gain, p_gain).await {
            tracing::warn!(address = ctx.address(), error = %e, "failed to set oversampling");
        }

        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().await;
        self.running.store(false, Ordering::SeqCst);

        let Some(link) = inner.link.take() else {
            return Ok(());
        };
        if let Err(e) = link.write_register(REGISTER_CTRL_MEAS, &[MODE_SLEEP]).await {
            tracing::warn!(address = %inner.address, error = %e, "failed to put sensor to sleep");
        }
        link.release().await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Thermometer for Bmp280Driver {
    fn supported_gains(&self) -> Vec<GainValue> {
        GAINS.to_vec()
    }

    fn supported_intervals(&self) -> Vec<SleepInterval> {
        STANDBY_TIMES.to_vec()
    }

    async fn gain(&self) -> Result<GainValue, DeviceError> {
        let inner = self.inner.lock().await;
        inner.link()?;
        Ok(inner.temperature_gain)
    }

    async fn set_gain(&self, id: u32) -> Result<(), DeviceError> {
        let gain = resolve_option(&GAINS, id)?;
        let mut inner = self.inner.lock().await;
        inner.write_ctrl_meas(gain, inner.pressure_gain).await?;
        inner.temperature_gain = gain;
        Ok(())
    }

    async fn interval(&self) -> Result<SleepInterval, DeviceError> {
        let inner = self.inner.lock().await;
        inner.link()?;
        Ok(inner.standby)
    }

    async fn set_interval(&self, id: u32) -> Result<(), DeviceError> {
        let standby = resolve_option(&STANDBY_TIMES, id)?;
        let mut inner = self.inner.lock().await;
        inner.write_standby(standby).await?;
        inner.standby = standby;
        Ok(())
    }

    async fn temperature_celsius(&self) -> Result<f32, DeviceError> {
        let inner = self.inner.lock().await;
        Ok(inner.measure().await?.0)
    }
}

#[async_trait]
impl Barometer for Bmp280Driver {
    fn supported_gains(&self) -> Vec<GainValue> {
        GAINS.to_vec()
    }

    fn supported_intervals(&self) -> Vec<SleepInterval> {
        STANDBY_TIMES.to_vec()
    }

    async fn gain(&self) -> Result<GainValue, DeviceError> {
        let inner = self.inner.lock().await;
        inner.link()?;
        Ok(inner.pressure_gain)
    }

    async fn set_gain(&self, id: u32) -> Result<(), DeviceError> {
        let gain = resolve_option(&GAINS, id)?;
        let mut inner = self.inner.lock().await;
        inner.write_ctrl_meas(inner.temperature_gain, gain).await?;
        inner.pressure_gain = gain;
        Ok(())
    }

    async fn interval(&self) -> Result<SleepInterval, DeviceError> {
        Thermometer::interval(self).await
    }

    async fn set_interval(&self, id: u32) -> Result<(), DeviceError> {
        Thermometer::set_interval(self, id).await
    }

    async fn pressure(&self) -> Result<f32, DeviceError> {
        let inner = self.inner.lock().await;
        Ok(inner.measure().await?.1)
    }
}

pub struct Bmp280Factory;

impl DriverFactory for Bmp280Factory {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn description(&self) -> &'static str {
        "BMP280 digital pressure and temperature sensor"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::Thermometer, Capability::Barometer]
    }

    fn supported_buses(&self) -> &'static [BusKind] {
        &[BusKind::I2c, BusKind::I2cSysfs]
    }

    fn create(&self, config: &serde_json::Value) -> Result<DriverInstance, DeviceError> {
        let driver = Arc::new(Bmp280Driver::new(parse_config(config)?)?);
        Ok(DriverInstance {
            capabilities: CapabilityTable::new()
                .with_thermometer(driver.clone())
                .with_barometer(driver.clone()),
            driver,
        })
    }
}

/// Datasheet calibration example, section 3.12.
#[cfg(test)]
pub(crate) const DATASHEET_CALIBRATION: [u8; CALIB_DATA_LEN] = [
    0x70, 0x6B, 0x43, 0x67, 0x18, 0xFC, 0x7D, 0x8E, 0x43, 0xD6, 0xD0, 0x0B, 0x27, 0x0B, 0x8C,
    0x00, 0xF9, 0xFF, 0x8C, 0x3C, 0xF8, 0xC6, 0x70, 0x17,
];

/// Pressure then temperature readout matching adc_P = 415148, adc_T = 519888.
#[cfg(test)]
pub(crate) const DATASHEET_READOUT: [u8; 6] = [0x65, 0x5A, 0xC0, 0x7E, 0xED, 0x00];
