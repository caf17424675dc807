//! End-to-end tests: simulated panel, in-memory store, real scheduler.

use std::sync::Arc;
use std::time::Duration;

use cryosight_bridge_framework::{
    BridgeConfig, Format, MemoryStore, Publisher, StoreKey, TelemetryPoint, TelemetryValue,
};
use tokio::sync::watch;
use tokio::time::Instant;

use zenoh_bridge_cryocompressor::config::{ControlKeysConfig, CryoBridgeConfig};
use zenoh_bridge_cryocompressor::registers::{
    DeviceProfile, Encoding, RegisterField, StatusRegisters, Unit,
};
use zenoh_bridge_cryocompressor::retry::RetryPolicy;
use zenoh_bridge_cryocompressor::sim::{SimDevice, SimTransport};
use zenoh_bridge_cryocompressor::translate::StatusTable;
use zenoh_bridge_cryocompressor::{
    DeviceAdapter, DeviceSet, PollScheduler, SchedulerConfig, SchedulerError, SchedulerState,
    TelemetryBridge,
};

const KEY: &str = "cryostat/compressor";

fn point(store: &MemoryStore, field: &str) -> TelemetryPoint {
    store
        .get_point(&format!("{}/{}", KEY, field))
        .unwrap_or_else(|| panic!("{} was never published", field))
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(10),
        failure_threshold: 3,
        backoff_initial: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
        shutdown_grace: Duration::from_millis(150),
        startup_attempts: 2,
        initial_frequency_hz: None,
    }
}

fn bridge(store: &MemoryStore) -> TelemetryBridge<MemoryStore> {
    let publisher = Publisher::new(
        Arc::new(store.clone()),
        StoreKey::new("cryostat", "compressor").unwrap(),
        "compressor",
        Format::Json,
    );
    TelemetryBridge::new(publisher, Vec::new(), Duration::ZERO)
}

fn adapter(sim: &SimDevice) -> DeviceAdapter<SimTransport> {
    DeviceAdapter::compressor("compressor", sim.transport())
        .with_retry(RetryPolicy::once())
        .with_io_timeout(Duration::from_secs(1))
}

fn scheduler(
    sim: &SimDevice,
    store: &MemoryStore,
    config: SchedulerConfig,
) -> PollScheduler<SimTransport, MemoryStore> {
    PollScheduler::new(
        config,
        DeviceSet::new(adapter(sim)),
        bridge(store),
        ControlKeysConfig::default(),
    )
}

async fn wait_for_publish(store: &MemoryStore, field: &str) {
    let key = format!("{}/{}", KEY, field);
    tokio::time::timeout(Duration::from_secs(2), async {
        while store.get(&key).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("nothing published");
}

#[tokio::test]
async fn test_coldhead_rpm_and_warning_published() {
    let sim = SimDevice::new();
    sim.set_input(33, 0x0301)
        .set_input(1, 3)
        .set_input(2, 1)
        .set_input(34, 3000)
        .set_input_i32(52, 0b100)
        .set_input_i32(54, 0);

    let profile = DeviceProfile::new("test-panel")
        .with_status(StatusRegisters {
            state: RegisterField::input("state_code", 1, Encoding::Uint16),
            enabled: RegisterField::input("enabled", 2, Encoding::Uint16),
            warning: RegisterField::input("warning_code", 52, Encoding::Bitfield),
            error: RegisterField::input("error_code", 54, Encoding::Bitfield),
        })
        .with_field(
            RegisterField::input("coldhead_rpm", 34, Encoding::Int16).with_unit(Unit::fixed("RPM")),
        )
        .with_status_table(StatusTable::default().with_alarm(2, "high oil temp"));

    let store = MemoryStore::new();
    let mut scheduler = PollScheduler::new(
        config(),
        DeviceSet::new(adapter(&sim).with_profile(profile)),
        bridge(&store),
        ControlKeysConfig::default(),
    );
    scheduler.start().await.unwrap();

    let rpm = point(&store, "coldhead_rpm");
    assert_eq!(rpm.value, TelemetryValue::Integer(3000));
    assert_eq!(rpm.unit(), Some("RPM"));
    assert_eq!(point(&store, "warning_code").value, TelemetryValue::Integer(4));
    assert_eq!(point(&store, "warnings").value.as_text(), Some("high oil temp"));
    assert_eq!(point(&store, "errors").value.as_text(), Some("None"));
    assert_eq!(point(&store, "state").value.as_text(), Some("Running"));
    assert_eq!(point(&store, "comm_status").value.as_text(), Some("good"));
}

#[tokio::test]
async fn test_rejected_write_keeps_published_value() {
    let sim = SimDevice::cryomech_v3();
    let store = MemoryStore::new();
    let mut scheduler = scheduler(&sim, &store, config());
    scheduler.start().await.unwrap();
    let before = point(&store, "inverter_set_freq").value;
    assert_eq!(before.as_f64(), Some(60.0));

    sim.reject_writes(true);
    store.inject(&format!("{}/frequency_control", KEY), "65");
    scheduler.poll_cycle().await;

    assert_eq!(point(&store, "inverter_set_freq").value, before);
    assert_eq!(point(&store, "control_status").value.as_text(), Some("rejected"));

    // Out of range never reaches the device.
    sim.reject_writes(false);
    store.inject(&format!("{}/frequency_control", KEY), "95");
    scheduler.poll_cycle().await;

    assert!(sim.writes().is_empty());
    assert_eq!(point(&store, "inverter_set_freq").value, before);
    let error = point(&store, "control_error");
    assert!(error.value.as_text().unwrap().contains("outside"));
}

#[tokio::test]
async fn test_latest_command_wins() {
    let sim = SimDevice::cryomech_v3();
    let store = MemoryStore::new();
    let mut scheduler = scheduler(&sim, &store, config());
    scheduler.start().await.unwrap();

    store.inject(&format!("{}/frequency_control", KEY), "50");
    store.inject(&format!("{}/frequency_control", KEY), "62");
    store.inject(&format!("{}/compressor_control", KEY), "off");
    let report = scheduler.poll_cycle().await;

    assert_eq!(report.commands_applied, 2);
    assert_eq!(sim.writes(), vec![(1, 0x00FF), (3, 620)]);
    assert_eq!(point(&store, "state").value.as_text(), Some("Ready to start"));
    assert_eq!(point(&store, "inverter_freq").value.as_f64(), Some(62.0));
}

#[tokio::test]
async fn test_backoff_after_threshold_only() {
    let sim = SimDevice::cryomech_v3();
    let store = MemoryStore::new();
    let mut scheduler = scheduler(
        &sim,
        &store,
        SchedulerConfig {
            failure_threshold: 4,
            ..config()
        },
    );
    scheduler.start().await.unwrap();

    sim.set_offline(true);
    for _ in 0..3 {
        scheduler.poll_cycle().await;
    }
    assert_eq!(scheduler.state(), SchedulerState::Polling);
    assert_eq!(scheduler.consecutive_failures(), 3);

    scheduler.poll_cycle().await;
    assert_eq!(scheduler.state(), SchedulerState::Backoff);
    assert_eq!(point(&store, "comm_status").value.as_text(), Some("connection error"));
}

#[tokio::test]
async fn test_failed_reads_keep_last_published_value() {
    let sim = SimDevice::cryomech_v3();
    let store = MemoryStore::new();
    let mut scheduler = scheduler(&sim, &store, config());
    scheduler.start().await.unwrap();
    let helium = point(&store, "helium_temp");

    sim.set_input(43, 1600);
    sim.set_offline(true);
    scheduler.poll_cycle().await;

    let after = point(&store, "helium_temp");
    assert_eq!(after.value, helium.value);
    assert_eq!(after.timestamp, helium.timestamp);
}

#[tokio::test]
async fn test_publish_retried_after_store_failure() {
    let sim = SimDevice::cryomech_v3();
    let store = MemoryStore::new();
    let mut scheduler = scheduler(&sim, &store, config());
    scheduler.start().await.unwrap();

    sim.set_input(43, 1600);
    store.fail_next_puts(1);
    let report = scheduler.poll_cycle().await;
    assert!(!report.published);
    assert!(!scheduler.bridge().pending().is_empty());

    let report = scheduler.poll_cycle().await;
    assert!(report.published);
    assert!(scheduler.bridge().pending().is_empty());
    assert_eq!(point(&store, "helium_temp").value.as_f64(), Some(160.0));
}

#[tokio::test]
async fn test_shutdown_mid_cycle_respects_grace() {
    let sim = SimDevice::cryomech_v3();
    let store = MemoryStore::new();
    let scheduler = scheduler(&sim, &store, config());
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(scheduler.run(rx));
    wait_for_publish(&store, "comm_status").await;

    // Every read now takes longer than the whole grace period.
    sim.set_latency(Duration::from_millis(200));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let requested = Instant::now();
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap()
        .unwrap();

    assert!(requested.elapsed() < Duration::from_millis(500));
    assert!(!sim.is_connected());
}

#[tokio::test]
async fn test_startup_failure_stops_scheduler() {
    let sim = SimDevice::cryomech_v3();
    sim.set_offline(true);
    let store = MemoryStore::new();
    let scheduler = scheduler(&sim, &store, config());
    let (_tx, rx) = watch::channel(false);

    let err = scheduler.run(rx).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Startup { attempts: 2, .. }));
    assert_eq!(store.put_count(), 0);
}

#[tokio::test]
async fn test_configured_external_inverter() {
    let config = CryoBridgeConfig::from_json5(
        r#"{
            store: { table: "cryostat", key: "compressor" },
            compressor: { connection: { type: "tcp", host: "10.0.0.5" }, retries: 1 },
            inverter: {
                type: "external",
                connection: { type: "rtu", port: "/dev/ttyUSB0", baud_rate: 9600 },
                unit_id: 2,
                initial_frequency_hz: 55,
            },
            polling: { poll_interval_secs: 0.01, logging_interval_secs: 0.01 },
        }"#,
    )
    .unwrap();

    let compressor = SimDevice::cryomech_v2();
    let inverter = SimDevice::external_inverter();
    let devices = DeviceSet::from_config(
        &config,
        compressor.transport(),
        Some(inverter.transport()),
    );
    let store = MemoryStore::new();
    let mut scheduler = PollScheduler::new(
        SchedulerConfig::from_config(&config),
        devices,
        bridge(&store),
        config.store.control.clone(),
    );

    scheduler.start().await.unwrap();

    assert_eq!(inverter.writes(), vec![(0x0001, 5500)]);
    assert!(compressor.writes().is_empty());
    assert_eq!(point(&store, "inverter_freq").value.as_f64(), Some(55.0));
    assert_eq!(point(&store, "inverter_voltage").unit(), Some("V"));
    assert_eq!(point(&store, "model").value.as_text(), Some("CPA1002"));
    assert!(config.store_key().is_ok());
}

#[tokio::test]
async fn test_failed_command_not_masked_by_later_success() {
    let sim = SimDevice::cryomech_v3();
    let store = MemoryStore::new();
    let mut scheduler = scheduler(&sim, &store, config());
    scheduler.start().await.unwrap();

    sim.reject_writes_to(1);
    store.inject(&format!("{}/compressor_control", KEY), "off");
    store.inject(&format!("{}/frequency_control", KEY), "55");
    let report = scheduler.poll_cycle().await;

    assert_eq!(report.commands_applied, 1);
    assert_eq!(sim.writes(), vec![(3, 550)]);
    assert_eq!(point(&store, "control_status").value.as_text(), Some("rejected"));
    let error = point(&store, "control_error");
    assert!(error.value.as_text().unwrap().starts_with("power:"));
}

#[tokio::test]
async fn test_commands_during_backoff_are_dropped() {
    let sim = SimDevice::cryomech_v3();
    let store = MemoryStore::new();
    let mut scheduler = scheduler(
        &sim,
        &store,
        SchedulerConfig {
            failure_threshold: 1,
            ..config()
        },
    );
    scheduler.start().await.unwrap();

    sim.set_offline(true);
    scheduler.poll_cycle().await;
    assert_eq!(scheduler.state(), SchedulerState::Backoff);

    store.inject(&format!("{}/compressor_control", KEY), "off");
    for _ in 0..5 {
        assert!(!scheduler.recover().await);
    }
    assert!(scheduler.mailbox().is_empty());
    assert_eq!(point(&store, "control_status").value.as_text(), Some("failed"));
    assert!(point(&store, "control_error").value.as_text().unwrap().contains("unreachable"));

    sim.set_offline(false);
    assert!(scheduler.recover().await);
    let report = scheduler.poll_cycle().await;

    assert_eq!(report.commands_applied, 0);
    assert!(sim.writes().is_empty());
    assert_eq!(point(&store, "state").value.as_text(), Some("Running"));
}

#[tokio::test]
async fn test_untranslatable_field_is_dropped_alone() {
    let sim = SimDevice::cryomech_v2();
    let store = MemoryStore::new();
    let mut scheduler = scheduler(&sim, &store, config());
    scheduler.start().await.unwrap();
    let helium = point(&store, "helium_temp");

    // helium_temp becomes a quiet NaN, low word first.
    sim.set_input(13, 0x0000).set_input(14, 0x7FC0);
    sim.set_input_f32(19, 300.0);
    let report = scheduler.poll_cycle().await;

    assert_eq!(report.fields_failed, 1);
    assert!(report.published);
    assert_eq!(scheduler.consecutive_failures(), 0);
    assert_eq!(scheduler.state(), SchedulerState::Polling);

    let after = point(&store, "helium_temp");
    assert_eq!(after.value, helium.value);
    assert_eq!(after.timestamp, helium.timestamp);
    assert_eq!(point(&store, "high_pressure").value.as_f64(), Some(300.0));
    assert_eq!(point(&store, "comm_status").value.as_text(), Some("good"));
}
