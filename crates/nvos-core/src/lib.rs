//! Core types shared by the NVOS root controller.
//!
//! This crate carries no hardware knowledge. It defines the error taxonomy,
//! the configuration file model, the event bus used to announce registry
//! changes, and the retry policy handed to drivers.

pub mod config;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod retry;

pub use config::{
    ArbiterSettings, ConfigError, Configuration, ControllerConfig, DeviceConfig, DriverSettings,
    LoggingSettings,
};
pub use error::{Classify, ErrorKind};
pub use event::{DeviceEvent, EventMetadata};
pub use eventbus::{EventBus, EventBusReceiver, FilteredReceiver, DEFAULT_CHANNEL_CAPACITY};
pub use retry::RetryPolicy;
