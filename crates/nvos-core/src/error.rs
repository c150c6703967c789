//! Error taxonomy shared by every layer.
//!
//! Each concrete error type in the workspace classifies itself into one of
//! these kinds so that callers can decide whether a retry makes sense.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request, unknown address, unsupported capability or option.
    /// Never retried.
    Client,
    /// Exclusivity timeout. The caller may retry with backoff.
    ResourceContention,
    /// Hardware or transport fault during an otherwise valid operation.
    Driver,
    /// A bus controller or driver failed to start.
    Initialization,
    /// Registry invariant violation.
    Internal,
}

impl ErrorKind {
    /// Whether a caller may reasonably retry an operation that failed with this kind.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::ResourceContention | ErrorKind::Driver)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Client => "client",
            ErrorKind::ResourceContention => "resource_contention",
            ErrorKind::Driver => "driver",
            ErrorKind::Initialization => "initialization",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by error types that map onto [`ErrorKind`].
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}
