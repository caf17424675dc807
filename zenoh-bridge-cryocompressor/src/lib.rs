//! Zenoh bridge for Cryomech CPA compressors.
//!
//! This bridge polls a compressor's digital panel (and optionally its drive
//! inverter) over Modbus TCP or RTU, translates the registers into physical
//! values and decoded status, and publishes them to Zenoh. Power and inverter
//! frequency can be controlled remotely by writing to control keys.
//!
//! # Key Expressions
//!
//! ```text
//! <table>/<key>/<field>                  # one telemetry point per field
//! <table>/<key>/compressor_control       # power on/off requests
//! <table>/<key>/frequency_control        # inverter frequency requests (Hz)
//! <table>/<key>/@/status                 # bridge status
//! ```
//!
//! # Published fields
//!
//! - Measurements: `coolant_in`, `coolant_out`, `oil_temp`, `helium_temp`,
//!   `low_pressure`, `high_pressure`, ..., `motor_current`, `hours`,
//!   `coldhead_rpm` (revision 3 panels), `inverter_*` (when present)
//! - Status: `enabled`, `state`, `state_code`, `warnings`, `warning_code`,
//!   `errors`, `error_code`
//! - Identity: `serial_number`, `model`, `software_rev`
//! - Daemon: `comm_status`, `comm_error`, `control_status`,
//!   `control_error`, `suspect_readings`

pub mod bridge;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod registers;
pub mod retry;
pub mod scheduler;
pub mod sim;
pub mod translate;
pub mod transport;

pub use bridge::TelemetryBridge;
pub use config::CryoBridgeConfig;
pub use control::{ControlCommand, ControlDispatcher, ControlKey, Mailbox};
pub use device::{DeviceAdapter, DeviceReading, DeviceSet, Identity};
pub use error::{DeviceError, SchedulerError, TransportError};
pub use scheduler::{PollScheduler, SchedulerConfig, SchedulerState};
pub use transport::{ModbusTransport, RegisterTransport};
