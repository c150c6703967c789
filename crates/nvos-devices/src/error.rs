//! Error types for bus controllers, drivers and the registry.

use nvos_core::{Classify, ErrorKind};

use crate::capability::Capability;

/// Failure reported by a transport backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error on channel {channel}: {message}")]
    Io { channel: u32, message: String },

    #[error("channel {0} is not available on this transport")]
    NoSuchChannel(u32),

    #[error("channel {channel} does not support {operation}")]
    Unsupported { channel: u32, operation: String },

    #[error("transport could not be opened: {0}")]
    Open(String),
}

/// Errors surfaced by the device framework.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    /// No device registered at this address
    #[error("no device registered at address '{0}'")]
    NotFound(String),

    #[error("a device is already registered at address '{0}'")]
    DuplicateAddress(String),

    #[error("bus controller '{0}' is already loaded")]
    DuplicateController(String),

    #[error("bus controller '{0}' is not loaded")]
    UnknownBusController(String),

    #[error("no driver named '{0}'")]
    UnknownDriver(String),

    #[error("device '{address}' does not support the {capability} capability")]
    CapabilityNotSupported {
        address: String,
        capability: Capability,
    },

    /// An option id that is not in the capability's option table
    #[error("unsupported {option} option id {id}")]
    UnsupportedOption { option: &'static str, id: u32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid driver configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid controller spec: {0}")]
    InvalidSpec(String),

    #[error("device '{0}' is not running")]
    NotRunning(String),

    #[error("resource '{0}' is not exposed by its controller")]
    UnknownResource(String),

    /// The resource is held by another owner and the wait timed out
    #[error("resource '{resource}' is held by '{holder}'")]
    ResourceBusy { resource: String, holder: String },

    /// Release of a token that is no longer live. Non-fatal.
    #[error("token for resource '{0}' was already released")]
    AlreadyReleased(String),

    #[error("lease on resource '{0}' is no longer held")]
    ResourceNotHeld(String),

    #[error("hardware error: {0}")]
    Hardware(String),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("driver initialization failed for '{address}': {reason}")]
    DriverInitFailed { address: String, reason: String },

    #[error("bus controller '{name}' failed to start: {reason}")]
    ControllerInitFailed { name: String, reason: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl DeviceError {
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl Classify for DeviceError {
    fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::NotFound(_)
            | DeviceError::DuplicateAddress(_)
            | DeviceError::DuplicateController(_)
            | DeviceError::UnknownBusController(_)
            | DeviceError::UnknownDriver(_)
            | DeviceError::CapabilityNotSupported { .. }
            | DeviceError::UnsupportedOption { .. }
            | DeviceError::InvalidArgument(_)
            | DeviceError::InvalidConfig(_)
            | DeviceError::InvalidSpec(_)
            | DeviceError::NotRunning(_)
            | DeviceError::UnknownResource(_)
            | DeviceError::AlreadyReleased(_)
            | DeviceError::ResourceNotHeld(_) => ErrorKind::Client,
            DeviceError::ResourceBusy { .. } => ErrorKind::ResourceContention,
            DeviceError::Hardware(_) | DeviceError::Timeout { .. } => ErrorKind::Driver,
            DeviceError::DriverInitFailed { .. } | DeviceError::ControllerInitFailed { .. } => {
                ErrorKind::Initialization
            }
            DeviceError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<TransportError> for DeviceError {
    fn from(e: TransportError) -> Self {
        DeviceError::Hardware(e.to_string())
    }
}
