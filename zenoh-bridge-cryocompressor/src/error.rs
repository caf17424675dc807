//! Error types for device access and the poll loop.

use std::time::Duration;

use thiserror::Error;

/// Failure of a single transport call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("I/O timed out after {0:?}")]
    Timeout(Duration),
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Malformed response: {0}")]
    Malformed(String),
    /// Modbus exception response.
    #[error("Device exception: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Exception responses are answers, not faults; everything else may clear up.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Rejected(_))
    }

    /// Whether the connection should be dropped and re-established.
    pub fn drops_connection(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_) | TransportError::Connection(_) | TransportError::NotConnected
        )
    }
}

/// Errors surfaced by a [`DeviceAdapter`](crate::device::DeviceAdapter).
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Transient communication failure that outlived the retry policy.
    #[error("{field}: communication failed after {attempts} attempt(s): {source}")]
    Communication {
        field: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// The device or local validation refused a write.
    #[error("{field}: value rejected: {reason}")]
    Rejected { field: String, reason: String },

    /// Registers came back in a shape the field's encoding cannot represent.
    #[error("{field}: cannot translate raw value: {reason}")]
    Translation { field: String, reason: String },

    /// The scheduler is backing off; nothing was sent.
    #[error("{field}: device unreachable, command dropped")]
    Unreachable { field: String },

    #[error("Unknown field '{0}'")]
    UnknownField(String),
}

impl DeviceError {
    pub fn rejected(field: impl Into<String>, reason: impl ToString) -> Self {
        Self::Rejected {
            field: field.into(),
            reason: reason.to_string(),
        }
    }

    pub fn translation(field: impl Into<String>, reason: impl ToString) -> Self {
        Self::Translation {
            field: field.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_communication(&self) -> bool {
        matches!(self, Self::Communication { .. })
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Errors that stop the poll scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Startup failed after {attempts} attempt(s): {source}")]
    Startup {
        attempts: u32,
        #[source]
        source: DeviceError,
    },

    #[error("Store error: {0}")]
    Store(#[from] cryosight_bridge_framework::BridgeError),
}
