//! Configuration for the compressor bridge.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cryosight_bridge_framework::{BridgeConfig, BridgeError, Format, LoggingConfig, StoreKey, ZenohConfig};

use crate::registers::{MAX_FREQUENCY_HZ, MIN_FREQUENCY_HZ};
use crate::retry::RetryPolicy;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<ConfigError> for BridgeError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation(msg) => BridgeError::ConfigValidation(msg),
        }
    }
}

/// Field names the bridge publishes on its own account.
pub const RESERVED_FIELDS: &[&str] = &[
    "comm_status",
    "comm_error",
    "control_status",
    "control_error",
    "suspect_readings",
];

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryoBridgeConfig {
    /// Zenoh connection settings
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Payload encoding
    #[serde(default)]
    pub serialization: Format,

    /// Where telemetry lands and where control requests arrive
    pub store: StoreConfig,

    /// The compressor panel
    pub compressor: DeviceConnectionConfig,

    /// Drive inverter, if any
    #[serde(default)]
    pub inverter: Option<InverterConfig>,

    /// Cadence and failure handling
    #[serde(default)]
    pub polling: PollingConfig,

    /// Fields to publish; empty publishes everything the register map provides
    #[serde(default)]
    pub logged_fields: Vec<LoggedField>,
}

/// Store location settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// First level of `{table}.{key}.{field}`
    pub table: String,

    /// Second level of `{table}.{key}.{field}`
    #[serde(default = "default_store_key")]
    pub key: String,

    /// Control subkeys under `{table}.{key}`
    #[serde(default)]
    pub control: ControlKeysConfig,

    /// Samples kept per field for late-joining readers (0 disables)
    #[serde(default = "default_history")]
    pub history: usize,
}

fn default_store_key() -> String {
    "compressor".to_string()
}

fn default_history() -> usize {
    1
}

/// Control subkey names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlKeysConfig {
    #[serde(default = "default_power_key")]
    pub power: String,

    #[serde(default = "default_frequency_key")]
    pub frequency: String,
}

fn default_power_key() -> String {
    "compressor_control".to_string()
}

fn default_frequency_key() -> String {
    "frequency_control".to_string()
}

impl Default for ControlKeysConfig {
    fn default() -> Self {
        Self {
            power: default_power_key(),
            frequency: default_frequency_key(),
        }
    }
}

/// How to reach one Modbus device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConnectionConfig {
    /// Connection type and address
    pub connection: ConnectionConfig,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Per-call I/O timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Attempts per operation, including the first
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// First retry delay in milliseconds, doubling per attempt
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Retry delay cap in milliseconds
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

fn default_unit_id() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    200
}

fn default_retry_max_ms() -> u64 {
    2000
}

impl DeviceConnectionConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retries,
            Duration::from_millis(self.retry_delay_ms),
            Duration::from_millis(self.retry_max_ms),
        )
    }

    fn validate(&self, device: &str) -> Result<(), ConfigError> {
        if self.unit_id == 0 || self.unit_id > 247 {
            return Err(ConfigError::Validation(format!(
                "{}: unit_id must be 1-247",
                device
            )));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Validation(format!(
                "{}: timeout_ms must be positive",
                device
            )));
        }
        if self.retries == 0 {
            return Err(ConfigError::Validation(format!(
                "{}: retries must be at least 1",
                device
            )));
        }
        self.connection.validate(device)
    }
}

/// Connection configuration (TCP or RTU).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// Modbus TCP connection
    Tcp {
        /// Host address (IP or hostname)
        host: String,
        /// TCP port (default: 502)
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    /// Modbus RTU (serial) connection
    Rtu {
        /// Serial port path (e.g., "/dev/ttyUSB0" or "COM1")
        port: String,
        /// Baud rate (default: 9600)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Data bits (default: 8)
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        /// Parity: "none", "even", or "odd" (default: "none")
        #[serde(default = "default_parity")]
        parity: String,
        /// Stop bits: 1 or 2 (default: 1)
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

impl ConnectionConfig {
    fn validate(&self, device: &str) -> Result<(), ConfigError> {
        match self {
            ConnectionConfig::Tcp { host, .. } if host.trim().is_empty() => Err(
                ConfigError::Validation(format!("{}: host cannot be empty", device)),
            ),
            ConnectionConfig::Rtu { parity, .. } => match parity.to_lowercase().as_str() {
                "none" | "even" | "odd" => Ok(()),
                _ => Err(ConfigError::Validation(format!(
                    "{}: invalid parity '{}' (use none, even, or odd)",
                    device, parity
                ))),
            },
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionConfig::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            ConnectionConfig::Rtu {
                port, baud_rate, ..
            } => write!(f, "rtu://{}@{}", port, baud_rate),
        }
    }
}

/// Drive inverter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InverterConfig {
    /// Inverter registers exposed by the compressor panel itself
    Internal {
        #[serde(default)]
        initial_frequency_hz: Option<f64>,
    },
    /// Separate RS485 inverter with its own Modbus connection
    External {
        #[serde(flatten)]
        device: DeviceConnectionConfig,
        #[serde(default)]
        initial_frequency_hz: Option<f64>,
    },
}

impl InverterConfig {
    pub fn initial_frequency_hz(&self) -> Option<f64> {
        match self {
            InverterConfig::Internal {
                initial_frequency_hz,
            }
            | InverterConfig::External {
                initial_frequency_hz,
                ..
            } => *initial_frequency_hz,
        }
    }
}

/// Polling cadence and failure handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Seconds between device reads
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: f64,

    /// Seconds between store publishes (at least the poll interval)
    #[serde(default = "default_logging_interval_secs")]
    pub logging_interval_secs: f64,

    /// Consecutive all-failed cycles before backing off
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// First reconnect delay in seconds
    #[serde(default = "default_backoff_initial_secs")]
    pub backoff_initial_secs: f64,

    /// Reconnect delay cap in seconds
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: f64,

    /// Seconds an in-flight cycle may take to finish after shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: f64,

    /// Connection and identity attempts at startup
    #[serde(default = "default_startup_attempts")]
    pub startup_attempts: u32,
}

fn default_poll_interval_secs() -> f64 {
    10.0
}

fn default_logging_interval_secs() -> f64 {
    10.0
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_backoff_initial_secs() -> f64 {
    5.0
}

fn default_backoff_max_secs() -> f64 {
    300.0
}

fn default_shutdown_grace_secs() -> f64 {
    5.0
}

fn default_startup_attempts() -> u32 {
    3
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            logging_interval_secs: default_logging_interval_secs(),
            failure_threshold: default_failure_threshold(),
            backoff_initial_secs: default_backoff_initial_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            startup_attempts: default_startup_attempts(),
        }
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl PollingConfig {
    pub fn poll_interval(&self) -> Duration {
        seconds(self.poll_interval_secs)
    }

    pub fn logging_interval(&self) -> Duration {
        seconds(self.logging_interval_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        seconds(self.backoff_initial_secs)
    }

    pub fn backoff_max(&self) -> Duration {
        seconds(self.backoff_max_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        seconds(self.shutdown_grace_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("poll_interval_secs", self.poll_interval_secs),
            ("logging_interval_secs", self.logging_interval_secs),
            ("backoff_initial_secs", self.backoff_initial_secs),
            ("backoff_max_secs", self.backoff_max_secs),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Validation(format!(
                    "polling.{} must be a positive number of seconds",
                    name
                )));
            }
        }
        if !(self.shutdown_grace_secs.is_finite() && self.shutdown_grace_secs >= 0.0) {
            return Err(ConfigError::Validation(
                "polling.shutdown_grace_secs cannot be negative".to_string(),
            ));
        }
        if self.logging_interval_secs < self.poll_interval_secs {
            return Err(ConfigError::Validation(
                "polling.logging_interval_secs cannot be shorter than poll_interval_secs"
                    .to_string(),
            ));
        }
        if self.backoff_max_secs < self.backoff_initial_secs {
            return Err(ConfigError::Validation(
                "polling.backoff_max_secs cannot be shorter than backoff_initial_secs".to_string(),
            ));
        }
        if self.failure_threshold == 0 || self.startup_attempts == 0 {
            return Err(ConfigError::Validation(
                "polling.failure_threshold and startup_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One field to publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedField {
    /// Register map field name (e.g. "helium_temp", "warnings")
    pub name: String,

    /// Field name in the store, if different
    #[serde(default)]
    pub store_field: Option<String>,

    /// Unit label overriding the one derived from the panel
    #[serde(default)]
    pub unit: Option<String>,
}

impl LoggedField {
    pub fn store_name(&self) -> &str {
        self.store_field.as_deref().unwrap_or(&self.name)
    }
}

impl CryoBridgeConfig {
    /// Check everything serde cannot.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.compressor.validate("compressor")?;
        if let Some(InverterConfig::External { device, .. }) = &self.inverter {
            device.validate("inverter")?;
        }
        if let Some(hz) = self.inverter.as_ref().and_then(InverterConfig::initial_frequency_hz) {
            if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&hz) {
                return Err(ConfigError::Validation(format!(
                    "inverter.initial_frequency_hz {} outside {}-{} Hz",
                    hz, MIN_FREQUENCY_HZ, MAX_FREQUENCY_HZ
                )));
            }
        }
        self.polling.validate()?;

        let mut store_fields = HashSet::new();
        for field in &self.logged_fields {
            let name = field.store_name();
            if name.is_empty() || name.starts_with('@') || name.contains(['/', '*', '$', '?', '#']) {
                return Err(ConfigError::Validation(format!(
                    "logged field '{}' has an invalid store name",
                    field.name
                )));
            }
            if RESERVED_FIELDS.contains(&name) {
                return Err(ConfigError::Validation(format!(
                    "logged field '{}' uses reserved name '{}'",
                    field.name, name
                )));
            }
            if !store_fields.insert(name) {
                return Err(ConfigError::Validation(format!(
                    "store field '{}' is logged twice",
                    name
                )));
            }
        }

        let control = &self.store.control;
        if control.power == control.frequency {
            return Err(ConfigError::Validation(
                "store.control.power and store.control.frequency must differ".to_string(),
            ));
        }
        for subkey in [&control.power, &control.frequency] {
            if store_fields.contains(subkey.as_str()) || RESERVED_FIELDS.contains(&subkey.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "control subkey '{}' collides with a published field",
                    subkey
                )));
            }
        }
        Ok(())
    }

    pub fn initial_frequency_hz(&self) -> Option<f64> {
        self.inverter.as_ref().and_then(InverterConfig::initial_frequency_hz)
    }
}

impl BridgeConfig for CryoBridgeConfig {
    fn zenoh(&self) -> &ZenohConfig {
        &self.zenoh
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn store_key(&self) -> cryosight_bridge_framework::Result<StoreKey> {
        Ok(StoreKey::new(&self.store.table, &self.store.key)?)
    }

    fn serialization(&self) -> Format {
        self.serialization
    }

    fn shutdown_grace(&self) -> Duration {
        // The scheduler gets its own grace; the runner waits a little longer
        // so the scheduler can close its connections.
        self.polling.shutdown_grace() + Duration::from_secs(1)
    }

    fn store_history(&self) -> usize {
        self.store.history
    }

    fn validate(&self) -> cryosight_bridge_framework::Result<()> {
        if !self.zenoh.has_valid_mode() {
            return Err(BridgeError::validation(format!(
                "Invalid Zenoh mode '{}'",
                self.zenoh.mode
            )));
        }
        let key = self.store_key()?;
        for subkey in [&self.store.control.power, &self.store.control.frequency] {
            StoreKey::new(key.key(), subkey.as_str())?;
        }
        self.check()?;
        Ok(())
    }
}
