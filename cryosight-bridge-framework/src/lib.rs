//! CryoSight Bridge Framework
//!
//! Common abstractions for building bridges that publish telemetry to a
//! shared store.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading and validation
//! - [`BridgeRunner`] for managing bridge lifecycle (startup, shutdown, signal handling)
//! - [`TelemetryStore`] seam with [`ZenohStore`] and the in-memory [`MemoryStore`]
//! - [`Publisher`] for publishing field maps with automatic serialization
//! - [`BridgeArgs`] for common CLI argument parsing
//! - [`BridgeStatus`] for standardized status reporting
//!
//! # Example
//!
//! ```ignore
//! use cryosight_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = BridgeArgs::parse_with_default("mybridge.json5");
//!     let config = MyBridgeConfig::load(&args.config)?;
//!
//!     let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&args))
//!         .await?
//!         .with_status_publishing();
//!
//!     runner.spawn_critical("worker", my_worker(runner.publisher(), runner.shutdown_receiver()));
//!
//!     // Run until Ctrl+C / SIGTERM
//!     runner.run().await?;
//!     Ok(())
//! }
//! ```

mod args;
mod config;
mod error;
mod publisher;
mod runner;
mod status;
pub mod store;

pub use args::BridgeArgs;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use publisher::{PublishStats, Publisher};
pub use runner::BridgeRunner;
pub use status::{BridgeStatus, StatusPublisher};
pub use store::{MemoryStore, SampleCallback, StoreSample, TelemetryStore, ZenohStore};

// Re-export commonly used types from cryosight-common
pub use cryosight_common::{
    FieldMap, FieldValue, Format, LoggingConfig, StoreKey, TelemetryPoint, TelemetryValue,
    ZenohConfig,
};
