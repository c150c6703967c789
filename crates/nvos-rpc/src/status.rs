//! RPC status codes and the mapping from device errors.

use serde::{Deserialize, Serialize};
use std::fmt;

use nvos_core::{Classify, ErrorKind};
use nvos_devices::DeviceError;

/// Status code carried by every failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Unavailable,
    DeadlineExceeded,
    Unimplemented,
    Internal,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Unavailable => "UNAVAILABLE",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failed call result.
///
/// `kind` tells the caller whether retrying can help.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: Code,
    pub kind: ErrorKind,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code,
            kind,
            message: message.into(),
        }
    }

    /// Malformed request payload.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, ErrorKind::Client, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, ErrorKind::Client, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, ErrorKind::Internal, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<DeviceError> for Status {
    fn from(err: DeviceError) -> Self {
        let code = match &err {
            DeviceError::NotFound(_) => Code::NotFound,
            DeviceError::DuplicateAddress(_) | DeviceError::DuplicateController(_) => {
                Code::AlreadyExists
            }
            DeviceError::CapabilityNotSupported { .. }
            | DeviceError::UnsupportedOption { .. }
            | DeviceError::InvalidArgument(_)
            | DeviceError::InvalidConfig(_)
            | DeviceError::InvalidSpec(_)
            | DeviceError::UnknownDriver(_)
            | DeviceError::UnknownResource(_) => Code::InvalidArgument,
            DeviceError::UnknownBusController(_)
            | DeviceError::NotRunning(_)
            | DeviceError::AlreadyReleased(_)
            | DeviceError::ResourceNotHeld(_)
            | DeviceError::DriverInitFailed { .. }
            | DeviceError::ControllerInitFailed { .. } => Code::FailedPrecondition,
            DeviceError::ResourceBusy { .. } => Code::Unavailable,
            DeviceError::Timeout { .. } => Code::DeadlineExceeded,
            DeviceError::Hardware(_) | DeviceError::Internal(_) => Code::Internal,
        };
        Self::new(code, err.kind(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvos_devices::Capability;

    #[test]
    fn test_device_error_mapping() {
        let status = Status::from(DeviceError::NotFound("uart0:gps".into()));
        assert_eq!(status.code, Code::NotFound);
        assert_eq!(status.kind, ErrorKind::Client);
        assert!(status.message.contains("uart0:gps"));

        let status = Status::from(DeviceError::CapabilityNotSupported {
            address: "led".into(),
            capability: Capability::Gps,
        });
        assert_eq!(status.code, Code::InvalidArgument);
        assert!(!status.is_retryable());

        let status = Status::from(DeviceError::ResourceBusy {
            resource: "i2c:i2c1:41".into(),
            holder: "light".into(),
        });
        assert_eq!(status.code, Code::Unavailable);
        assert!(status.is_retryable());

        // Hardware faults are retryable even though they surface as INTERNAL
        let status = Status::from(DeviceError::Hardware("nack".into()));
        assert_eq!(status.code, Code::Internal);
        assert_eq!(status.kind, ErrorKind::Driver);
        assert!(status.is_retryable());

        let status = Status::from(DeviceError::Internal("broken".into()));
        assert_eq!(status.kind, ErrorKind::Internal);
        assert!(!status.is_retryable());
    }

    #[test]
    fn test_status_wire_format() {
        let status = Status::unimplemented("no such method");
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["code"], "UNIMPLEMENTED");
        assert_eq!(value["kind"], "client");
        assert_eq!(status.to_string(), "UNIMPLEMENTED: no such method");
    }
}
