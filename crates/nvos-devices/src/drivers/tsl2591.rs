//! TSL2591 ambient light sensor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::bus::BusKind;
use crate::capability::{
    resolve_option, Capability, CapabilityTable, GainValue, IntegrationTime, LightChannel,
    LightSensor,
};
use crate::driver::{parse_config, DeviceDriver, DriverContext, DriverFactory, DriverInstance};
use crate::drivers::BusLink;
use crate::error::DeviceError;

pub const DRIVER_NAME: &str = "tsl2591";

pub const DEFAULT_I2C_ADDR: u32 = 0x29;
const CHIP_ID: u8 = 0x50;
const LUX_DF: f32 = 735.0;

const COMMAND_BIT: u8 = 0xA0;
const REGISTER_ENABLE: u8 = 0x00;
const REGISTER_CONTROL: u8 = 0x01;
const REGISTER_ID: u8 = 0x12;
const REGISTER_CHAN0_LOW: u8 = 0x14;

const ENABLE_POWEROFF: u8 = 0x00;
const ENABLE_POWERON: u8 = 0x01;
const ENABLE_AEN: u8 = 0x02;

/// Gain ids double as the CONTROL register gain field.
pub const GAINS: [GainValue; 4] = [
    GainValue { id: 0, multiplier: 1 },
    GainValue { id: 1, multiplier: 25 },
    GainValue { id: 2, multiplier: 428 },
    GainValue { id: 3, multiplier: 9876 },
];

/// Integration time ids double as the CONTROL register timing field.
pub const INTEGRATION_TIMES: [IntegrationTime; 6] = [
    IntegrationTime { id: 0, time_ms: 100 },
    IntegrationTime { id: 1, time_ms: 200 },
    IntegrationTime { id: 2, time_ms: 300 },
    IntegrationTime { id: 3, time_ms: 400 },
    IntegrationTime { id: 4, time_ms: 500 },
    IntegrationTime { id: 5, time_ms: 600 },
];

const CHANNEL_FULL: u32 = 0;
const CHANNEL_INFRARED: u32 = 1;
const CHANNEL_VISIBLE: u32 = 2;

pub fn channels() -> Vec<LightChannel> {
    [
        (CHANNEL_FULL, "Visible+Infrared"),
        (CHANNEL_INFRARED, "Infrared"),
        (CHANNEL_VISIBLE, "Visible"),
    ]
    .into_iter()
    .map(|(id, name)| LightChannel {
        id,
        name: name.to_string(),
    })
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tsl2591Config {
    /// I2C address.
    pub address: u32,
    pub gain_id: u32,
    pub interval_id: u32,
    pub auto_gain: bool,
}

impl Default for Tsl2591Config {
    fn default() -> Self {
        Self {
            address: DEFAULT_I2C_ADDR,
            gain_id: 0,
            interval_id: 0,
            auto_gain: true,
        }
    }
}

fn control_byte(gain: GainValue, interval: IntegrationTime) -> u8 {
    ((gain.id as u8) << 4) | interval.id as u8
}

/// Count at which the ADC saturates.
fn overflow_value(interval: IntegrationTime) -> u16 {
    if interval.time_ms == 100 {
        36863
    } else {
        u16::MAX
    }
}

fn gain_by_multiplier(multiplier: u32) -> GainValue {
    GAINS
        .into_iter()
        .find(|g| g.multiplier == multiplier)
        .unwrap_or(GAINS[0])
}

/// Pick the gain that keeps the full-spectrum count within roughly a third
/// to two thirds of the ADC range.
pub fn next_gain(current: GainValue, c0: u16, interval: IntegrationTime) -> GainValue {
    let third = u16::MAX / 3;
    let divider = if interval.time_ms == 100 { 2 } else { 1 };
    let too_high = ((u16::MAX as f32) * 0.945) as u16 / divider;

    let next = match current.multiplier {
        1 => {
            if c0 < third / 428 {
                428
            } else if c0 < third / 25 {
                25
            } else {
                1
            }
        }
        25 => {
            if c0 < third / (9876 / 25) {
                9876
            } else if c0 < third / (428 / 25) {
                428
            } else if c0 > too_high {
                1
            } else {
                25
            }
        }
        428 => {
            if c0 < third / (9876 / 428) {
                9876
            } else if c0 > too_high {
                25
            } else {
                428
            }
        }
        _ => {
            if c0 > too_high {
                428
            } else {
                9876
            }
        }
    };
    gain_by_multiplier(next)
}

/// Lux from the full-spectrum and infrared counts.
pub fn lux(c0: u16, c1: u16, gain: GainValue, interval: IntegrationTime) -> f32 {
    let c0 = c0.max(1) as f32;
    let c1 = c1 as f32;
    let cpl = (interval.time_ms as f32 * gain.multiplier as f32) / LUX_DF;
    ((c0 - c1) * (1.0 - c1 / c0)) / cpl
}

struct TslInner {
    address: String,
    link: Option<BusLink>,
    gain: GainValue,
    interval: IntegrationTime,
    auto_gain: bool,
}

impl TslInner {
    fn link(&self) -> Result<&BusLink, DeviceError> {
        self.link
            .as_ref()
            .ok_or_else(|| DeviceError::NotRunning(self.address.clone()))
    }

    /// Read CH0 and CH1, then let auto-gain react to the sample.
    async fn sample(&mut self) -> Result<(u16, u16), DeviceError> {
        let raw = self
            .link()?
            .read_register(COMMAND_BIT | REGISTER_CHAN0_LOW, 4)
            .await?;
        let c0 = u16::from_le_bytes([raw[0], raw[1]]);
        let c1 = u16::from_le_bytes([raw[2], raw[3]]);

        if self.auto_gain {
            let next = next_gain(self.gain, c0, self.interval);
            if next != self.gain {
                tracing::debug!(
                    address = %self.address,
                    from = self.gain.multiplier,
                    to = next.multiplier,
                    "auto gain update"
                );
                let control = control_byte(next, self.interval);
                let written = self
                    .link()?
                    .write_register(COMMAND_BIT | REGISTER_CONTROL, &[control])
                    .await;
                match written {
                    Ok(()) => self.gain = next,
                    Err(e) => tracing::warn!(address = %self.address, error = %e, "failed to auto update gain"),
                }
            }
        }
        Ok((c0, c1))
    }
}

pub struct Tsl2591Driver {
    config: Tsl2591Config,
    inner: Mutex<TslInner>,
    running: AtomicBool,
}

impl Tsl2591Driver {
    pub fn new(config: Tsl2591Config) -> Result<Self, DeviceError> {
        let invalid = |e: DeviceError| DeviceError::InvalidConfig(e.to_string());
        let gain = resolve_option(&GAINS, config.gain_id).map_err(invalid)?;
        let interval = resolve_option(&INTEGRATION_TIMES, config.interval_id).map_err(invalid)?;
        if config.address > 0x7F {
            return Err(DeviceError::InvalidConfig(format!(
                "{:#x} is not a 7-bit I2C address",
                config.address
            )));
        }

        Ok(Self {
            inner: Mutex::new(TslInner {
                address: String::new(),
                link: None,
                gain,
                interval,
                auto_gain: config.auto_gain,
            }),
            config,
            running: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl DeviceDriver for Tsl2591Driver {
    fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn device_name(&self) -> String {
        "TSL2591 Light Sensor".to_string()
    }

    async fn start(&self, ctx: &DriverContext) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().await;
        if inner.link.is_some() {
            return Err(DeviceError::Internal(format!(
                "TSL2591 at '{}' started twice",
                ctx.address()
            )));
        }
        inner.address = ctx.address().to_string();

        let controller = ctx.controller().clone();
        let lease = ctx.acquire(&controller, self.config.address).await?;
        let link = BusLink::new(controller, lease, ctx.retry());

        let chip_id = link.read_register(COMMAND_BIT | REGISTER_ID, 1).await?[0];
        if chip_id != CHIP_ID {
            return Err(DeviceError::Hardware(format!(
                "address {:#04x} reported chip id {:#04x}, expected {:#04x}",
                self.config.address, chip_id, CHIP_ID
            )));
        }

        link.write_register(COMMAND_BIT | REGISTER_ENABLE, &[ENABLE_POWERON | ENABLE_AEN])
            .await?;

        let control = control_byte(inner.gain, inner.interval);
        if let Err(e) = link
            .write_register(COMMAND_BIT | REGISTER_CONTROL, &[control])
            .await
        {
            tracing::warn!(address = ctx.address(), error = %e, "failed to set initial timing and gain");
        }

        inner.link = Some(link);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().await;
        self.running.store(false, Ordering::SeqCst);

        let Some(link) = inner.link.take() else {
            return Ok(());
        };
        if let Err(e) = link
            .write_register(COMMAND_BIT | REGISTER_ENABLE, &[ENABLE_POWEROFF])
            .await
        {
            tracing::warn!(address = %inner.address, error = %e, "failed to power down sensor");
        }
        link.release().await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LightSensor for Tsl2591Driver {
    fn supported_gains(&self) -> Vec<GainValue> {
        GAINS.to_vec()
    }

    fn supported_intervals(&self) -> Vec<IntegrationTime> {
        INTEGRATION_TIMES.to_vec()
    }

    fn supported_channels(&self) -> Vec<LightChannel> {
        channels()
    }

    async fn gain(&self) -> Result<GainValue, DeviceError> {
        let inner = self.inner.lock().await;
        inner.link()?;
        Ok(inner.gain)
    }

    async fn set_gain(&self, id: u32) -> Result<(), DeviceError> {
        let gain = resolve_option(&GAINS, id)?;
        let mut inner = self.inner.lock().await;
        let control = control_byte(gain, inner.interval);
        inner
            .link()?
            .write_register(COMMAND_BIT | REGISTER_CONTROL, &[control])
            .await?;
        inner.gain = gain;
        Ok(())
    }

    async fn interval(&self) -> Result<IntegrationTime, DeviceError> {
        let inner = self.inner.lock().await;
        inner.link()?;
        Ok(inner.interval)
    }

    async fn set_interval(&self, id: u32) -> Result<(), DeviceError> {
        let interval = resolve_option(&INTEGRATION_TIMES, id)?;
        let mut inner = self.inner.lock().await;
        let control = control_byte(inner.gain, interval);
        inner
            .link()?
            .write_register(COMMAND_BIT | REGISTER_CONTROL, &[control])
            .await?;
        inner.interval = interval;
        Ok(())
    }

    async fn auto_gain_enabled(&self) -> Result<bool, DeviceError> {
        let inner = self.inner.lock().await;
        inner.link()?;
        Ok(inner.auto_gain)
    }

    async fn set_auto_gain(&self, enabled: bool) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().await;
        inner.link()?;
        inner.auto_gain = enabled;
        Ok(())
    }

    async fn luminosity(&self, channel_id: u32) -> Result<u32, DeviceError> {
        let channel = resolve_option(&channels(), channel_id)?;
        let mut inner = self.inner.lock().await;
        let (c0, c1) = inner.sample().await?;

        match channel.id {
            CHANNEL_FULL => Ok(c0.into()),
            CHANNEL_INFRARED => Ok(c1.into()),
            _ if c1 > c0 => Err(DeviceError::Hardware("infrared overflow".to_string())),
            _ => Ok((c0 - c1).into()),
        }
    }

    async fn illuminance(&self) -> Result<f32, DeviceError> {
        let mut inner = self.inner.lock().await;
        // The sample is taken with the settings in force before auto-gain reacts to it.
        let (gain, interval) = (inner.gain, inner.interval);
        let (c0, c1) = inner.sample().await?;

        let overflow = overflow_value(interval);
        if c0 >= overflow || c1 >= overflow {
            return Err(DeviceError::Hardware("sensor reading overflow".to_string()));
        }
        Ok(lux(c0, c1, gain, interval))
    }
}

pub struct Tsl2591Factory;

impl DriverFactory for Tsl2591Factory {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn description(&self) -> &'static str {
        "TSL2591 high dynamic range light sensor"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::LightSensor]
    }

    fn supported_buses(&self) -> &'static [BusKind] {
        &[BusKind::I2c, BusKind::I2cSysfs]
    }

    fn create(&self, config: &serde_json::Value) -> Result<DriverInstance, DeviceError> {
        let driver = Arc::new(Tsl2591Driver::new(parse_config(config)?)?);
        Ok(DriverInstance {
            capabilities: CapabilityTable::new().with_light_sensor(driver.clone()),
            driver,
        })
    }
}
