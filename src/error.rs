//! Error types for the PPC1 controller.
//!
//! `Ppc1Error` is the crate-wide error. It is built with `thiserror` and groups
//! the failure classes the controller distinguishes:
//!
//! - **`OutOfRange` / `Validation`**: a request was rejected before any byte
//!   was written to the serial line.
//! - **`Transport`**: a write or read on the serial line failed.
//! - **`Connection`**: explicit connect/disconnect failed, including a device
//!   identity mismatch. Carries a [`ConnectionError`] with a typed kind.
//! - **`Decode`**: a telemetry frame was malformed. These are counted and
//!   dropped by the polling task and never escalate on their own.
//! - **`Fault`**: the polling task lost the device while streaming. The
//!   controller is Faulted until an operator reconnects.
//!
//! Configuration, protocol-file and plain I/O errors round out the set.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, Ppc1Error>;

#[derive(Error, Debug)]
pub enum Ppc1Error {
    #[error("{what} value {value} is outside [{min}, {max}]")]
    OutOfRange {
        what: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Telemetry decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Device fault: {0}")]
    Fault(DeviceFault),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Ppc1Error {
    pub(crate) fn out_of_range(what: impl Into<String>, value: f64, min: f64, max: f64) -> Self {
        Ppc1Error::OutOfRange {
            what: what.into(),
            value,
            min,
            max,
        }
    }

    /// True for errors raised before any I/O took place.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Ppc1Error::OutOfRange { .. } | Ppc1Error::Validation(_)
        )
    }
}

impl From<figment::Error> for Ppc1Error {
    fn from(err: figment::Error) -> Self {
        Ppc1Error::Config(err.to_string())
    }
}

/// Category of a failed connect or disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// The port could not be opened or enumerated.
    IoFailure,
    /// The named port does not exist or was not open.
    PortNotOpen,
    /// The port is not a PPC1 (vendor/product id mismatch).
    ProtocolMismatch,
}

impl std::fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionErrorKind::IoFailure => write!(f, "I/O failure"),
            ConnectionErrorKind::PortNotOpen => write!(f, "Port not open"),
            ConnectionErrorKind::ProtocolMismatch => write!(f, "Protocol mismatch"),
        }
    }
}

/// Typed failure surfaced by connect/disconnect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Connection error ({kind}): {message}")]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
}

impl ConnectionError {
    pub fn new(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Failure of a single line-level serial operation.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Serial port not open")]
    NotOpen,

    #[error("No line received within {0:?}")]
    Timeout(Duration),

    #[error("Unexpected EOF from serial port")]
    Eof,

    #[error("Serial I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a telemetry frame is rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("expected {expected} fields, found {found} in '{line}'")]
    FieldCount {
        expected: usize,
        found: usize,
        line: String,
    },

    #[error("expected channel {expected}, found '{found}'")]
    UnexpectedChannel { expected: char, found: String },

    #[error("invalid number '{field}' in '{line}'")]
    InvalidNumber { field: String, line: String },

    #[error("malformed valve field '{0}'")]
    Valve(String),

    #[error("malformed sync field '{0}'")]
    Sync(String),

    #[error("frame has {found} of 6 lines")]
    IncompleteFrame { found: usize },
}

/// Sticky fault recorded when the device is lost while streaming.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceFault {
    pub message: String,
    pub at: DateTime<Utc>,
}

impl DeviceFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            at: Utc::now(),
        }
    }
}

impl std::fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (at {})", self.message, self.at.to_rfc3339())
    }
}
