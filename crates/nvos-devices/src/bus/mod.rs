//! Bus controllers and the transport contract they are built on.
//!
//! A [`BusController`] owns one [`Transport`] and hands out channels through
//! the shared [`ExclusivityArbiter`]. Every I/O call takes the
//! [`ChannelLease`] obtained from [`BusController::acquire`], so a driver can
//! only touch lines, addresses or ports it owns.

pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::arbiter::{ExclusivityArbiter, ExclusivityToken};
use crate::error::{DeviceError, TransportError};

pub use simulated::{SimulatedProvider, SimulatedTransport};

/// Default upper bound on a single transport operation.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_millis(500);

/// Transport backend of a bus controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    Raw,
    RawSysfs,
    Pwm,
    PwmSysfs,
    I2c,
    I2cSysfs,
    Uart,
}

/// Transport family, independent of the backend flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusFamily {
    Gpio,
    Pwm,
    I2c,
    Uart,
}

impl BusKind {
    pub const ALL: [BusKind; 7] = [
        BusKind::Raw,
        BusKind::RawSysfs,
        BusKind::Pwm,
        BusKind::PwmSysfs,
        BusKind::I2c,
        BusKind::I2cSysfs,
        BusKind::Uart,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BusKind::Raw => "raw",
            BusKind::RawSysfs => "raw_sysfs",
            BusKind::Pwm => "pwm",
            BusKind::PwmSysfs => "pwm_sysfs",
            BusKind::I2c => "i2c",
            BusKind::I2cSysfs => "i2c_sysfs",
            BusKind::Uart => "uart",
        }
    }

    pub fn family(self) -> BusFamily {
        match self {
            BusKind::Raw | BusKind::RawSysfs => BusFamily::Gpio,
            BusKind::Pwm | BusKind::PwmSysfs => BusFamily::Pwm,
            BusKind::I2c | BusKind::I2cSysfs => BusFamily::I2c,
            BusKind::Uart => BusFamily::Uart,
        }
    }
}

impl BusFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            BusFamily::Gpio => "gpio",
            BusFamily::Pwm => "pwm",
            BusFamily::I2c => "i2c",
            BusFamily::Uart => "uart",
        }
    }
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BusKind {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BusKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DeviceError::InvalidSpec(format!("unknown bus kind '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Per-channel configuration understood by transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelSetting {
    Gpio {
        direction: Direction,
    },
    Pwm {
        period_ns: u32,
        duty_ns: u32,
        enabled: bool,
    },
    Serial {
        baud_rate: u32,
        parity: Parity,
        data_bits: u8,
        stop_bits: u8,
    },
}

/// Raw access to one physical bus.
///
/// Channels are transport specific: a GPIO line, a PWM channel, a 7-bit I2C
/// address or a UART port. For I2C, a write whose first byte is a register
/// number moves the register pointer and stores any remaining bytes from
/// there; a read returns bytes from the current pointer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn configure(&self, channel: u32, setting: &ChannelSetting)
        -> Result<(), TransportError>;

    async fn write(&self, channel: u32, data: &[u8]) -> Result<(), TransportError>;

    /// Read up to `len` bytes. Serial ports may return fewer.
    async fn read(&self, channel: u32, len: usize) -> Result<Vec<u8>, TransportError>;

    /// Return a channel to its idle state (unexport, close).
    async fn release(&self, _channel: u32) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Opens transports for bus controllers described in configuration.
pub trait TransportProvider: Send + Sync {
    fn open(
        &self,
        name: &str,
        kind: BusKind,
        data: &serde_json::Value,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Exclusive use of one channel of one controller.
#[derive(Debug)]
pub struct ChannelLease {
    channel: u32,
    token: ExclusivityToken,
}

impl ChannelLease {
    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub fn resource(&self) -> &str {
        self.token.resource()
    }
}

/// A loaded bus controller.
pub struct BusController {
    name: String,
    kind: BusKind,
    /// Channels this controller may hand out; `None` allows any.
    channels: Option<BTreeSet<u32>>,
    transport: Arc<dyn Transport>,
    arbiter: Arc<ExclusivityArbiter>,
    io_timeout: Duration,
}

impl fmt::Debug for BusController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusController")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("channels", &self.channels)
            .field("io_timeout", &self.io_timeout)
            .finish()
    }
}

impl BusController {
    pub fn new(
        name: impl Into<String>,
        kind: BusKind,
        transport: Arc<dyn Transport>,
        arbiter: Arc<ExclusivityArbiter>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            channels: None,
            transport,
            arbiter,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    pub fn with_channels(mut self, channels: impl IntoIterator<Item = u32>) -> Self {
        self.channels = Some(channels.into_iter().collect());
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BusKind {
        self.kind
    }

    pub fn arbiter(&self) -> &Arc<ExclusivityArbiter> {
        &self.arbiter
    }

    /// Arbiter key for `channel`, e.g. `i2c:i2c1:41`.
    pub fn resource_id(&self, channel: u32) -> String {
        format!("{}:{}:{}", self.kind.family().as_str(), self.name, channel)
    }

    /// Acquire exclusive use of `channel` for `owner`.
    pub async fn acquire(
        &self,
        channel: u32,
        owner: &str,
        timeout: Duration,
    ) -> Result<ChannelLease, DeviceError> {
        if let Some(channels) = &self.channels {
            if !channels.contains(&channel) {
                return Err(DeviceError::UnknownResource(self.resource_id(channel)));
            }
        }

        let token = self
            .arbiter
            .acquire(&self.resource_id(channel), owner, timeout)
            .await?;
        Ok(ChannelLease { channel, token })
    }

    /// Return the channel to the transport and give up the lease.
    pub async fn release(&self, lease: ChannelLease) -> Result<(), DeviceError> {
        if self.arbiter.grant_count(lease.resource()) == 1 && self.arbiter.is_live(&lease.token) {
            if let Err(e) = self.transport.release(lease.channel).await {
                tracing::warn!(resource = lease.resource(), error = %e, "transport release failed");
            }
        }
        self.arbiter.release(lease.token)
    }

    pub async fn configure(
        &self,
        lease: &ChannelLease,
        setting: &ChannelSetting,
    ) -> Result<(), DeviceError> {
        self.check(lease)?;
        self.bounded("configure", self.transport.configure(lease.channel, setting))
            .await
    }

    pub async fn write(&self, lease: &ChannelLease, data: &[u8]) -> Result<(), DeviceError> {
        self.check(lease)?;
        self.bounded("write", self.transport.write(lease.channel, data))
            .await
    }

    pub async fn read(&self, lease: &ChannelLease, len: usize) -> Result<Vec<u8>, DeviceError> {
        self.check(lease)?;
        self.bounded("read", self.transport.read(lease.channel, len))
            .await
    }

    /// Write `data` to consecutive registers starting at `register`.
    pub async fn write_register(
        &self,
        lease: &ChannelLease,
        register: u8,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let mut frame = Vec::with_capacity(data.len() + 1);
        frame.push(register);
        frame.extend_from_slice(data);
        self.write(lease, &frame).await
    }

    /// Read `len` bytes starting at `register`.
    pub async fn read_register(
        &self,
        lease: &ChannelLease,
        register: u8,
        len: usize,
    ) -> Result<Vec<u8>, DeviceError> {
        self.write(lease, &[register]).await?;
        let data = self.read(lease, len).await?;
        if data.len() != len {
            return Err(DeviceError::Hardware(format!(
                "short read from register {:#04x}: expected {} bytes, got {}",
                register,
                len,
                data.len()
            )));
        }
        Ok(data)
    }

    /// Drive a GPIO line.
    pub async fn set_level(&self, lease: &ChannelLease, high: bool) -> Result<(), DeviceError> {
        self.write(lease, &[u8::from(high)]).await
    }

    fn check(&self, lease: &ChannelLease) -> Result<(), DeviceError> {
        if lease.resource() != self.resource_id(lease.channel) || !self.arbiter.is_live(&lease.token)
        {
            return Err(DeviceError::ResourceNotHeld(lease.resource().to_string()));
        }
        Ok(())
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl std::future::Future<Output = Result<T, TransportError>>,
    ) -> Result<T, DeviceError> {
        match tokio::time::timeout(self.io_timeout, fut).await {
            Ok(result) => result.map_err(DeviceError::from),
            Err(_) => Err(DeviceError::Timeout {
                operation: format!("{} on {}", operation, self.name),
                timeout_ms: self.io_timeout.as_millis() as u64,
            }),
        }
    }
}
