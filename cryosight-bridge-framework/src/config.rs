//! Configuration traits and utilities.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;

use cryosight_common::StoreKey;

use crate::error::{BridgeError, Result};
use crate::{Format, LoggingConfig, ZenohConfig};

/// Trait for bridge configuration types.
///
/// Implement this trait for your bridge's configuration struct to get
/// automatic loading, validation, and access to common config fields.
///
/// # Example
///
/// ```ignore
/// use serde::Deserialize;
/// use cryosight_bridge_framework::{BridgeConfig, LoggingConfig, StoreKey, ZenohConfig};
///
/// #[derive(Debug, Deserialize)]
/// pub struct MyBridgeConfig {
///     pub zenoh: ZenohConfig,
///     pub logging: LoggingConfig,
///     pub table: String,
///     pub key: String,
/// }
///
/// impl BridgeConfig for MyBridgeConfig {
///     fn zenoh(&self) -> &ZenohConfig {
///         &self.zenoh
///     }
///
///     fn logging(&self) -> &LoggingConfig {
///         &self.logging
///     }
///
///     fn store_key(&self) -> Result<StoreKey> {
///         Ok(StoreKey::new(&self.table, &self.key)?)
///     }
/// }
/// ```
pub trait BridgeConfig: Sized + DeserializeOwned {
    /// Get the Zenoh configuration.
    fn zenoh(&self) -> &ZenohConfig;

    /// Get the logging configuration.
    fn logging(&self) -> &LoggingConfig;

    /// The `{table}.{key}` this bridge owns for writes.
    fn store_key(&self) -> Result<StoreKey>;

    /// Serialization format for published payloads.
    fn serialization(&self) -> Format {
        Format::Json
    }

    /// How long in-flight work gets to finish after a shutdown signal.
    fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// Samples retained per key for late-joining readers. 0 disables the cache.
    fn store_history(&self) -> usize {
        1
    }

    /// Validate the configuration.
    ///
    /// Called automatically after loading. Override to add custom validation.
    fn validate(&self) -> Result<()> {
        if !self.zenoh().has_valid_mode() {
            return Err(BridgeError::validation(format!(
                "Invalid Zenoh mode '{}'",
                self.zenoh().mode
            )));
        }
        self.store_key()?;
        Ok(())
    }

    /// Load configuration from a file path.
    ///
    /// Supports JSON5 format. Calls [`validate`](Self::validate) after loading.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(BridgeError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_json5(&content)
    }

    /// Parse and validate configuration from a JSON5 string.
    fn from_json5(content: &str) -> Result<Self> {
        let config: Self = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        #[serde(default)]
        zenoh: ZenohConfig,
        #[serde(default)]
        logging: LoggingConfig,
        table: String,
        key: String,
    }

    impl BridgeConfig for TestConfig {
        fn zenoh(&self) -> &ZenohConfig {
            &self.zenoh
        }

        fn logging(&self) -> &LoggingConfig {
            &self.logging
        }

        fn store_key(&self) -> Result<StoreKey> {
            Ok(StoreKey::new(&self.table, &self.key)?)
        }
    }

    #[test]
    fn test_config_not_found() {
        let result = TestConfig::load("/nonexistent/path.json5");
        assert!(matches!(result, Err(BridgeError::ConfigNotFound { .. })));
    }

    #[test]
    fn test_defaults() {
        let config = TestConfig::from_json5("{ table: 'cryostat', key: 'compressor' }").unwrap();
        assert_eq!(config.serialization(), Format::Json);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(config.store_history(), 1);
        assert_eq!(config.store_key().unwrap().to_string(), "cryostat.compressor");
    }

    #[test]
    fn test_invalid_store_key_rejected() {
        let result = TestConfig::from_json5("{ table: 'cryo/stat', key: 'compressor' }");
        assert!(matches!(result, Err(BridgeError::ConfigValidation(_))));
    }

    #[test]
    fn test_invalid_zenoh_mode_rejected() {
        let result = TestConfig::from_json5(
            "{ zenoh: { mode: 'broker' }, table: 'cryostat', key: 'compressor' }",
        );
        assert!(matches!(result, Err(BridgeError::ConfigValidation(_))));
    }

    #[test]
    fn test_parse_error() {
        let result = TestConfig::from_json5("{ table: ");
        assert!(matches!(result, Err(BridgeError::ConfigParse(_))));
    }
}
