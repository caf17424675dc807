//! Zenoh bridge for Cryomech CPA compressors.
//!
//! Polls the compressor panel over Modbus and publishes its telemetry to
//! Zenoh; accepts power and inverter frequency commands.

use anyhow::{Context, Result};
use cryosight_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner, ZenohStore};

use zenoh_bridge_cryocompressor::config::{CryoBridgeConfig, InverterConfig};
use zenoh_bridge_cryocompressor::sim::SimDevice;
use zenoh_bridge_cryocompressor::{
    DeviceSet, ModbusTransport, PollScheduler, RegisterTransport, SchedulerConfig,
    TelemetryBridge,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("cryocompressor.json5");

    let config = CryoBridgeConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    if args.check_config {
        let store_key = config.store_key()?;
        println!("Configuration OK: {}", args.config.display());
        println!("  telemetry:  {}", store_key.wildcard());
        println!("  compressor: {}", config.compressor.connection);
        if let Some(InverterConfig::External { device, .. }) = &config.inverter {
            println!("  inverter:   {}", device.connection);
        }
        return Ok(());
    }

    let mut runner = BridgeRunner::new_with_args("cryocompressor", config, Some(&args))
        .await
        .context("Failed to start bridge")?
        .with_status_publishing();

    let config = runner.config().clone();

    if args.simulate {
        tracing::warn!("Polling a simulated compressor, no hardware will be touched");
        let inverter = match &config.inverter {
            Some(InverterConfig::External { .. }) => Some(SimDevice::external_inverter().transport()),
            _ => None,
        };
        let devices = DeviceSet::from_config(&config, SimDevice::cryomech_v3().transport(), inverter);
        spawn_scheduler(&mut runner, &config, devices);
    } else {
        let compressor =
            ModbusTransport::new(config.compressor.connection.clone(), config.compressor.unit_id);
        let inverter = match &config.inverter {
            Some(InverterConfig::External { device, .. }) => {
                Some(ModbusTransport::new(device.connection.clone(), device.unit_id))
            }
            _ => None,
        };
        let devices = DeviceSet::from_config(&config, compressor, inverter);
        spawn_scheduler(&mut runner, &config, devices);
    }

    tracing::info!(
        store_key = %runner.publisher().store_key(),
        compressor = %config.compressor.connection,
        poll_interval_secs = config.polling.poll_interval_secs,
        logging_interval_secs = config.polling.logging_interval_secs,
        "Compressor bridge running"
    );

    let metadata = serde_json::json!({
        "compressor": config.compressor.connection.to_string(),
        "inverter": match &config.inverter {
            Some(InverterConfig::Internal { .. }) => "internal".to_string(),
            Some(InverterConfig::External { device, .. }) => device.connection.to_string(),
            None => "none".to_string(),
        },
        "simulated": args.simulate,
        "poll_interval_secs": config.polling.poll_interval_secs,
        "logging_interval_secs": config.polling.logging_interval_secs,
    });

    runner
        .run_with_metadata(Some(metadata))
        .await
        .context("Compressor bridge stopped with an error")
}

fn spawn_scheduler<T>(
    runner: &mut BridgeRunner<CryoBridgeConfig>,
    config: &CryoBridgeConfig,
    devices: DeviceSet<T>,
) where
    T: RegisterTransport + 'static,
{
    let bridge: TelemetryBridge<ZenohStore> = TelemetryBridge::new(
        runner.publisher(),
        config.logged_fields.clone(),
        config.polling.logging_interval(),
    );
    let scheduler = PollScheduler::new(
        SchedulerConfig::from_config(config),
        devices,
        bridge,
        config.store.control.clone(),
    );
    let shutdown = runner.shutdown_receiver();
    runner.spawn_critical("scheduler", scheduler.run(shutdown));
}
