//! In-memory transport backend.
//!
//! Used by tests and by the CLI when no hardware backend is available. It
//! models GPIO levels, PWM channel settings, I2C register files and UART
//! receive/transmit queues, and can inject faults and latency.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use super::{BusFamily, BusKind, ChannelSetting, Transport, TransportProvider};
use crate::error::TransportError;

const REGISTER_FILE_SIZE: usize = 256;

#[derive(Debug)]
struct RegisterFile {
    bytes: [u8; REGISTER_FILE_SIZE],
    pointer: u8,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            bytes: [0; REGISTER_FILE_SIZE],
            pointer: 0,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    devices: HashMap<u32, RegisterFile>,
    levels: HashMap<u32, bool>,
    settings: HashMap<u32, ChannelSetting>,
    rx: HashMap<u32, VecDeque<u8>>,
    tx: HashMap<u32, Vec<u8>>,
    /// Remaining operations that fail, per channel.
    faults: HashMap<u32, u32>,
    releases: HashMap<u32, u32>,
}

/// A transport whose hardware lives in memory.
#[derive(Debug)]
pub struct SimulatedTransport {
    family: BusFamily,
    state: Mutex<SimState>,
    latency: Mutex<Duration>,
}

impl SimulatedTransport {
    pub fn new(kind: BusKind) -> Self {
        Self {
            family: kind.family(),
            state: Mutex::new(SimState::default()),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Make an I2C device answer at `address`.
    pub fn attach_device(&self, address: u32) {
        self.state.lock().devices.entry(address).or_default();
    }

    /// Preload registers of the I2C device at `address`, attaching it if needed.
    pub fn set_registers(&self, address: u32, register: u8, data: &[u8]) {
        let mut state = self.state.lock();
        let file = state.devices.entry(address).or_default();
        for (offset, byte) in data.iter().enumerate() {
            file.bytes[(register as usize + offset) % REGISTER_FILE_SIZE] = *byte;
        }
    }

    pub fn registers(&self, address: u32, register: u8, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        match state.devices.get(&address) {
            Some(file) => (0..len)
                .map(|offset| file.bytes[(register as usize + offset) % REGISTER_FILE_SIZE])
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn level(&self, line: u32) -> Option<bool> {
        self.state.lock().levels.get(&line).copied()
    }

    pub fn set_level(&self, line: u32, high: bool) {
        self.state.lock().levels.insert(line, high);
    }

    pub fn setting(&self, channel: u32) -> Option<ChannelSetting> {
        self.state.lock().settings.get(&channel).cloned()
    }

    /// Queue bytes as if received on serial `port`.
    pub fn push_rx(&self, port: u32, data: &[u8]) {
        self.state
            .lock()
            .rx
            .entry(port)
            .or_default()
            .extend(data.iter().copied());
    }

    /// Bytes queued on serial `port` that nobody has read yet.
    pub fn rx_pending(&self, port: u32) -> usize {
        self.state.lock().rx.get(&port).map_or(0, |queue| queue.len())
    }

    /// Drain everything written to serial `port`.
    pub fn take_tx(&self, port: u32) -> Vec<u8> {
        self.state.lock().tx.remove(&port).unwrap_or_default()
    }

    /// Fail the next `count` operations on `channel`.
    pub fn fail_next(&self, channel: u32, count: u32) {
        self.state.lock().faults.insert(channel, count);
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn release_count(&self, channel: u32) -> u32 {
        self.state.lock().releases.get(&channel).copied().unwrap_or(0)
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn take_fault(state: &mut SimState, channel: u32) -> Result<(), TransportError> {
        if let Some(remaining) = state.faults.get_mut(&channel) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Io {
                    channel,
                    message: "injected fault".to_string(),
                });
            }
        }
        Ok(())
    }

    fn unsupported(channel: u32, operation: &str) -> TransportError {
        TransportError::Unsupported {
            channel,
            operation: operation.to_string(),
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn configure(
        &self,
        channel: u32,
        setting: &ChannelSetting,
    ) -> Result<(), TransportError> {
        self.delay().await;
        let mut state = self.state.lock();
        Self::take_fault(&mut state, channel)?;

        let matches_family = matches!(
            (self.family, setting),
            (BusFamily::Gpio, ChannelSetting::Gpio { .. })
                | (BusFamily::Pwm, ChannelSetting::Pwm { .. })
                | (BusFamily::Uart, ChannelSetting::Serial { .. })
        );
        if !matches_family {
            return Err(Self::unsupported(channel, "this setting"));
        }

        state.settings.insert(channel, setting.clone());
        Ok(())
    }

    async fn write(&self, channel: u32, data: &[u8]) -> Result<(), TransportError> {
        self.delay().await;
        let mut state = self.state.lock();
        Self::take_fault(&mut state, channel)?;

        match self.family {
            BusFamily::Gpio => {
                let level = data.first().ok_or_else(|| TransportError::Io {
                    channel,
                    message: "empty write".to_string(),
                })?;
                state.levels.insert(channel, *level != 0);
            }
            BusFamily::I2c => {
                let file = state.devices.get_mut(&channel).ok_or(TransportError::Io {
                    channel,
                    message: "no acknowledge".to_string(),
                })?;
                if let Some((register, payload)) = data.split_first() {
                    file.pointer = *register;
                    for (offset, byte) in payload.iter().enumerate() {
                        file.bytes[(*register as usize + offset) % REGISTER_FILE_SIZE] = *byte;
                    }
                }
            }
            BusFamily::Uart => {
                state.tx.entry(channel).or_default().extend_from_slice(data);
            }
            BusFamily::Pwm => return Err(Self::unsupported(channel, "write")),
        }
        Ok(())
    }

    async fn read(&self, channel: u32, len: usize) -> Result<Vec<u8>, TransportError> {
        self.delay().await;
        let mut state = self.state.lock();
        Self::take_fault(&mut state, channel)?;

        match self.family {
            BusFamily::Gpio => {
                let level = state.levels.get(&channel).copied().unwrap_or(false);
                Ok(vec![u8::from(level)])
            }
            BusFamily::I2c => {
                let file = state.devices.get(&channel).ok_or(TransportError::Io {
                    channel,
                    message: "no acknowledge".to_string(),
                })?;
                Ok((0..len)
                    .map(|offset| file.bytes[(file.pointer as usize + offset) % REGISTER_FILE_SIZE])
                    .collect())
            }
            BusFamily::Uart => {
                let queue = state.rx.entry(channel).or_default();
                let take = len.min(queue.len());
                Ok(queue.drain(..take).collect())
            }
            BusFamily::Pwm => Err(Self::unsupported(channel, "read")),
        }
    }

    async fn release(&self, channel: u32) -> Result<(), TransportError> {
        *self.state.lock().releases.entry(channel).or_default() += 1;
        Ok(())
    }
}

/// Hands out [`SimulatedTransport`]s and remembers them by controller name.
///
/// Controller `data` may preload hardware state:
///
/// ```json
/// { "registers": { "41": { "178": 80 } }, "rx": { "0": "$GPGGA,..." } }
/// ```
#[derive(Debug, Default)]
pub struct SimulatedProvider {
    transports: Mutex<HashMap<String, Arc<SimulatedTransport>>>,
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport previously opened for controller `name`.
    pub fn transport(&self, name: &str) -> Option<Arc<SimulatedTransport>> {
        self.transports.lock().get(name).cloned()
    }

    fn preload(transport: &SimulatedTransport, data: &serde_json::Value) -> Result<(), TransportError> {
        if let Some(devices) = data.get("registers").and_then(|v| v.as_object()) {
            for (address, registers) in devices {
                let address = parse_number(address)?;
                transport.attach_device(address);
                for (register, value) in registers.as_object().into_iter().flatten() {
                    let register = parse_number(register)?;
                    let value = value.as_u64().filter(|v| *v <= u8::MAX as u64).ok_or_else(|| {
                        TransportError::Open(format!("register value {} is not a byte", value))
                    })?;
                    transport.set_registers(address, register as u8, &[value as u8]);
                }
            }
        }

        if let Some(ports) = data.get("rx").and_then(|v| v.as_object()) {
            for (port, text) in ports {
                let text = text.as_str().unwrap_or_default();
                transport.push_rx(parse_number(port)?, text.as_bytes());
            }
        }
        Ok(())
    }
}

fn parse_number(text: &str) -> Result<u32, TransportError> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| TransportError::Open(format!("'{}' is not a channel number", text)))
}

impl TransportProvider for SimulatedProvider {
    fn open(
        &self,
        name: &str,
        kind: BusKind,
        data: &serde_json::Value,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = Arc::new(SimulatedTransport::new(kind));
        Self::preload(&transport, data)?;
        self.transports
            .lock()
            .insert(name.to_string(), transport.clone());
        Ok(transport)
    }
}
