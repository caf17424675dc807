//! Error types for the bridge framework.

use thiserror::Error;

/// Result type alias using [`BridgeError`].
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur in a bridge.
///
/// `Publish`, `Subscribe` and `Serialization` together form the store error
/// class: they are logged and retried on the next cycle, never fatal once the
/// bridge is running.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration parse error.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration validation error.
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// Zenoh connection error.
    #[error("Zenoh connection error: {0}")]
    ZenohConnection(String),

    /// Zenoh session error.
    #[error("Zenoh session error: {0}")]
    ZenohSession(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Publishing error.
    #[error("Failed to publish to {key}: {message}")]
    Publish { key: String, message: String },

    /// Subscription error.
    #[error("Failed to subscribe to {key}: {message}")]
    Subscribe { key: String, message: String },

    /// Worker error.
    #[error("Worker '{name}' failed: {message}")]
    Worker { name: String, message: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a configuration validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    /// Create a publish error.
    pub fn publish(key: impl Into<String>, message: impl ToString) -> Self {
        Self::Publish {
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Create a subscribe error.
    pub fn subscribe(key: impl Into<String>, message: impl ToString) -> Self {
        Self::Subscribe {
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Create a worker error.
    pub fn worker(name: impl Into<String>, message: impl ToString) -> Self {
        Self::Worker {
            name: name.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error belongs to the store class (retry next cycle).
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            Self::Publish { .. } | Self::Subscribe { .. } | Self::Serialization(_)
        )
    }
}

impl From<zenoh::Error> for BridgeError {
    fn from(err: zenoh::Error) -> Self {
        Self::ZenohSession(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<json5::Error> for BridgeError {
    fn from(err: json5::Error) -> Self {
        Self::ConfigParse(err.to_string())
    }
}

impl From<cryosight_common::Error> for BridgeError {
    fn from(err: cryosight_common::Error) -> Self {
        match err {
            cryosight_common::Error::Config(msg) => Self::Config(msg),
            cryosight_common::Error::StoreKey { .. } => Self::ConfigValidation(err.to_string()),
            cryosight_common::Error::Zenoh(e) => Self::ZenohSession(e.to_string()),
            cryosight_common::Error::Io(e) => Self::Io(e),
            other => Self::Serialization(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_class() {
        assert!(BridgeError::publish("a/b/c", "timeout").is_store_error());
        assert!(BridgeError::subscribe("a/b/c", "closed").is_store_error());
        assert!(BridgeError::Serialization("bad".into()).is_store_error());
        assert!(!BridgeError::config("bad").is_store_error());
    }

    #[test]
    fn test_common_error_mapping() {
        let err: BridgeError = cryosight_common::Error::store_key("a/b", "contains '/'").into();
        assert!(matches!(err, BridgeError::ConfigValidation(_)));
    }
}
