//! PWM-dimmed LED with a GPIO line selecting visible or infrared emitters.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::bus::{BusFamily, BusKind, ChannelSetting, Direction};
use crate::capability::{Capability, CapabilityTable, LedController, LedMode, LedState};
use crate::driver::{parse_config, DeviceDriver, DriverContext, DriverFactory, DriverInstance};
use crate::drivers::BusLink;
use crate::error::DeviceError;

pub const DRIVER_NAME: &str = "generic_led";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedConfig {
    /// PWM channel on the controller the device is registered on.
    pub brightness_channel: u32,
    /// Controller carrying the mode switch line.
    pub mode_switch_controller: String,
    pub mode_switch_line: u32,
    /// Line level selecting visible light.
    pub vis_mode_level: bool,
    /// Line level selecting infrared.
    pub ir_mode_level: bool,
    pub pwm_period_ns: u32,
    pub pwm_duty_min_ns: u32,
    pub pwm_duty_max_ns: u32,
    pub default_mode: LedMode,
    pub default_brightness: f32,
    pub default_power_on: bool,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            brightness_channel: 0,
            mode_switch_controller: "gpio0".to_string(),
            mode_switch_line: 0,
            vis_mode_level: false,
            ir_mode_level: true,
            pwm_period_ns: 100,
            pwm_duty_min_ns: 0,
            pwm_duty_max_ns: 100,
            default_mode: LedMode::Visible,
            default_brightness: 0.5,
            default_power_on: true,
        }
    }
}

impl LedConfig {
    pub fn validate(&self) -> Result<(), DeviceError> {
        if !(0.0..=1.0).contains(&self.default_brightness) {
            return Err(DeviceError::InvalidConfig(format!(
                "default_brightness {} is outside 0.0..=1.0",
                self.default_brightness
            )));
        }
        if self.pwm_duty_min_ns >= self.pwm_duty_max_ns {
            return Err(DeviceError::InvalidConfig(
                "pwm_duty_min_ns must be below pwm_duty_max_ns".to_string(),
            ));
        }
        if self.pwm_duty_max_ns > self.pwm_period_ns {
            return Err(DeviceError::InvalidConfig(
                "pwm_duty_max_ns cannot exceed pwm_period_ns".to_string(),
            ));
        }
        if self.vis_mode_level == self.ir_mode_level {
            return Err(DeviceError::InvalidConfig(
                "vis_mode_level and ir_mode_level must differ".to_string(),
            ));
        }
        Ok(())
    }

    fn duty_ns(&self, state: &LedState) -> u32 {
        if !state.powered_on {
            return self.pwm_duty_min_ns;
        }
        let span = (self.pwm_duty_max_ns - self.pwm_duty_min_ns) as f32;
        self.pwm_duty_min_ns + (span * state.brightness).round() as u32
    }

    fn mode_level(&self, mode: LedMode) -> bool {
        match mode {
            LedMode::Visible => self.vis_mode_level,
            LedMode::Infrared => self.ir_mode_level,
        }
    }
}

struct LedLinks {
    pwm: BusLink,
    mode: BusLink,
}

struct LedInner {
    address: String,
    links: Option<LedLinks>,
    state: LedState,
}

pub struct LedDriver {
    config: LedConfig,
    inner: Mutex<LedInner>,
    running: AtomicBool,
}

impl LedDriver {
    pub fn new(config: LedConfig) -> Result<Self, DeviceError> {
        config.validate()?;
        let state = LedState {
            powered_on: config.default_power_on,
            brightness: config.default_brightness,
            mode: config.default_mode,
        };
        Ok(Self {
            config,
            inner: Mutex::new(LedInner {
                address: String::new(),
                links: None,
                state,
            }),
            running: AtomicBool::new(false),
        })
    }

    fn pwm_setting(&self, state: &LedState, enabled: bool) -> ChannelSetting {
        ChannelSetting::Pwm {
            period_ns: self.config.pwm_period_ns,
            duty_ns: self.config.duty_ns(state),
            enabled,
        }
    }

    /// Apply `update` to the hardware, committing it only once I/O succeeds.
    async fn apply<F>(&self, update: F) -> Result<(), DeviceError>
    where
        F: FnOnce(&mut LedState),
    {
        let mut inner = self.inner.lock().await;
        let Some(links) = inner.links.as_ref() else {
            return Err(DeviceError::NotRunning(inner.address.clone()));
        };

        let mut next = inner.state;
        update(&mut next);

        if next.mode != inner.state.mode {
            links.mode.set_level(self.config.mode_level(next.mode)).await?;
        }
        if self.config.duty_ns(&next) != self.config.duty_ns(&inner.state) {
            links.pwm.configure(&self.pwm_setting(&next, true)).await?;
        }

        inner.state = next;
        Ok(())
    }
}

#[async_trait]
impl DeviceDriver for LedDriver {
    fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn device_name(&self) -> String {
        "Generic LED".to_string()
    }

    async fn start(&self, ctx: &DriverContext) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().await;
        if inner.links.is_some() {
            return Err(DeviceError::Internal(format!(
                "LED at '{}' started twice",
                ctx.address()
            )));
        }
        inner.address = ctx.address().to_string();

        let gpio = ctx.controller_named(&self.config.mode_switch_controller)?;
        if gpio.kind().family() != BusFamily::Gpio {
            return Err(DeviceError::InvalidConfig(format!(
                "mode switch controller '{}' is not a GPIO controller",
                gpio.name()
            )));
        }
        let pwm = ctx.controller().clone();

        let mode_lease = ctx.acquire(&gpio, self.config.mode_switch_line).await?;
        let pwm_lease = ctx.acquire(&pwm, self.config.brightness_channel).await?;

        let links = LedLinks {
            mode: BusLink::new(gpio, mode_lease, ctx.retry()),
            pwm: BusLink::new(pwm, pwm_lease, ctx.retry()),
        };

        links
            .mode
            .configure(&ChannelSetting::Gpio {
                direction: Direction::Output,
            })
            .await?;

        // Defaults are best effort; the device stays usable without them.
        let state = inner.state;
        if let Err(e) = links.mode.set_level(self.config.mode_level(state.mode)).await {
            tracing::warn!(address = ctx.address(), error = %e, "failed to apply default LED mode");
        }
        if let Err(e) = links.pwm.configure(&self.pwm_setting(&state, true)).await {
            tracing::warn!(address = ctx.address(), error = %e, "failed to apply default LED brightness");
        }

        inner.links = Some(links);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().await;
        self.running.store(false, Ordering::SeqCst);

        let Some(links) = inner.links.take() else {
            return Ok(());
        };

        let off = LedState {
            powered_on: false,
            ..inner.state
        };
        if let Err(e) = links.pwm.configure(&self.pwm_setting(&off, false)).await {
            tracing::warn!(address = %inner.address, error = %e, "failed to switch LED off");
        }

        links.pwm.release().await;
        links.mode.release().await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedController for LedDriver {
    async fn state(&self) -> Result<LedState, DeviceError> {
        let inner = self.inner.lock().await;
        if inner.links.is_none() {
            return Err(DeviceError::NotRunning(inner.address.clone()));
        }
        Ok(inner.state)
    }

    async fn set_brightness(&self, brightness: f32) -> Result<(), DeviceError> {
        if !(0.0..=1.0).contains(&brightness) {
            return Err(DeviceError::InvalidArgument(format!(
                "brightness {} is outside 0.0..=1.0",
                brightness
            )));
        }
        self.apply(|state| state.brightness = brightness).await
    }

    async fn set_mode(&self, mode: LedMode) -> Result<(), DeviceError> {
        self.apply(|state| state.mode = mode).await
    }

    async fn set_power(&self, on: bool) -> Result<(), DeviceError> {
        self.apply(|state| state.powered_on = on).await
    }
}

pub struct LedFactory;

impl DriverFactory for LedFactory {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn description(&self) -> &'static str {
        "PWM dimmed LED with a visible/infrared mode switch line"
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::LedController]
    }

    fn supported_buses(&self) -> &'static [BusKind] {
        &[BusKind::Pwm, BusKind::PwmSysfs]
    }

    fn create(&self, config: &serde_json::Value) -> Result<DriverInstance, DeviceError> {
        let driver = Arc::new(LedDriver::new(parse_config(config)?)?);
        Ok(DriverInstance {
            capabilities: CapabilityTable::new().with_led(driver.clone()),
            driver,
        })
    }
}
