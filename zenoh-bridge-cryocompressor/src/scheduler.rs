//! Poll scheduler.
//!
//! One task owns the devices and the bridge. Each tick it applies pending
//! control commands, reads every field, and publishes when the logging
//! interval has elapsed. Repeated full-cycle failures move it into backoff,
//! where it waits and reconnects before polling again.

use std::time::Duration;

use cryosight_bridge_framework::TelemetryStore;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bridge::TelemetryBridge;
use crate::config::{ControlKeysConfig, CryoBridgeConfig};
use crate::control::{ControlCommand, ControlDispatcher, ControlKey, Mailbox};
use crate::device::{DeviceAdapter, DeviceReading, DeviceSet};
use crate::error::{DeviceError, SchedulerError};
use crate::retry::Backoff;
use crate::translate::decode_status;
use crate::transport::RegisterTransport;

/// Timing and failure handling for the poll loop.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// Consecutive full-cycle failures before entering backoff.
    pub failure_threshold: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// How long an in-flight cycle may run after shutdown is requested.
    pub shutdown_grace: Duration,
    pub startup_attempts: u32,
    pub initial_frequency_hz: Option<f64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            failure_threshold: 3,
            backoff_initial: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(5),
            startup_attempts: 3,
            initial_frequency_hz: None,
        }
    }
}

impl SchedulerConfig {
    pub fn from_config(config: &CryoBridgeConfig) -> Self {
        let polling = &config.polling;
        Self {
            poll_interval: polling.poll_interval(),
            failure_threshold: polling.failure_threshold,
            backoff_initial: polling.backoff_initial(),
            backoff_max: polling.backoff_max(),
            shutdown_grace: polling.shutdown_grace(),
            startup_attempts: polling.startup_attempts,
            initial_frequency_hz: config.initial_frequency_hz(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Starting,
    Polling,
    Backoff,
    Stopping,
}

/// What one poll cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fields_read: usize,
    pub fields_failed: usize,
    pub commands_applied: usize,
    pub published: bool,
}

impl CycleReport {
    /// Nothing could be read at all.
    pub fn is_full_failure(&self) -> bool {
        self.fields_read == 0 && self.fields_failed > 0
    }
}

/// Drives the devices and the bridge.
pub struct PollScheduler<T, S> {
    config: SchedulerConfig,
    devices: DeviceSet<T>,
    bridge: TelemetryBridge<S>,
    dispatcher: ControlDispatcher,
    control_keys: ControlKeysConfig,
    state: SchedulerState,
    consecutive_failures: u32,
    backoff: Backoff,
}

impl<T, S> PollScheduler<T, S>
where
    T: RegisterTransport,
    S: TelemetryStore,
{
    pub fn new(
        config: SchedulerConfig,
        devices: DeviceSet<T>,
        bridge: TelemetryBridge<S>,
        control_keys: ControlKeysConfig,
    ) -> Self {
        let backoff = Backoff::new(config.backoff_initial, config.backoff_max);
        Self {
            config,
            devices,
            bridge,
            dispatcher: ControlDispatcher::new(Mailbox::new()),
            control_keys,
            state: SchedulerState::Stopped,
            consecutive_failures: 0,
            backoff,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn mailbox(&self) -> &Mailbox {
        self.dispatcher.mailbox()
    }

    pub fn devices(&self) -> &DeviceSet<T> {
        &self.devices
    }

    pub fn bridge(&self) -> &TelemetryBridge<S> {
        &self.bridge
    }

    /// Identify the panel, subscribe to the control keys and publish the
    /// first full reading.
    pub async fn start(&mut self) -> Result<CycleReport, SchedulerError> {
        self.state = SchedulerState::Starting;

        let attempts = self.config.startup_attempts.max(1);
        let mut delay = Backoff::new(self.config.backoff_initial, self.config.backoff_max);
        let mut attempt = 1;
        let identity = loop {
            match self.devices.compressor.identify().await {
                Ok(identity) => break identity,
                Err(e) if attempt < attempts => {
                    warn!(attempt, attempts, error = %e, "Compressor identification failed, retrying");
                    tokio::time::sleep(delay.current()).await;
                    delay.fail();
                    attempt += 1;
                }
                Err(source) => {
                    self.state = SchedulerState::Stopped;
                    return Err(SchedulerError::Startup { attempts, source });
                }
            }
        };
        self.bridge.stage_identity(&identity);

        self.bridge
            .subscribe_controls(self.dispatcher.mailbox(), &self.control_keys)
            .await?;

        if let Some(hz) = self.config.initial_frequency_hz {
            info!(frequency_hz = hz, "Applying initial inverter frequency");
            self.mailbox().post(ControlCommand::new(ControlKey::Frequency, hz));
        }

        self.state = SchedulerState::Polling;
        let report = self.poll_cycle().await;
        info!(
            fields = report.fields_read,
            failed = report.fields_failed,
            "Polling started"
        );
        Ok(report)
    }

    /// Run one poll cycle.
    pub async fn poll_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        let outcomes = self.dispatcher.dispatch(&mut self.devices).await;
        self.bridge.stage_controls(&outcomes);
        report.commands_applied = outcomes.iter().filter(|o| o.is_ok()).count();

        let mut last_error: Option<DeviceError> = None;
        let mut readings = Vec::new();

        match self.devices.compressor.read_status().await {
            Ok(Some(snapshot)) => {
                let status = decode_status(&snapshot, self.devices.compressor.status_table());
                self.bridge.stage_status(&status);
                report.fields_read += 1;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(device = %self.devices.compressor.name(), error = %e, "Status read failed");
                report.fields_failed += 1;
                last_error = Some(e);
            }
        }

        for adapter in self.devices.adapters_mut() {
            let (read, failed, error) = read_fields(adapter, &mut readings).await;
            report.fields_read += read;
            report.fields_failed += failed;
            if error.is_some() {
                last_error = error;
            }
        }

        self.bridge.stage_readings(&readings);

        if report.is_full_failure() {
            let message = last_error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "Not Connected".to_string());
            self.bridge.stage_comm(Some(&message));
            self.consecutive_failures += 1;
        } else {
            self.bridge.stage_comm(None);
            self.consecutive_failures = 0;
        }

        let now = Instant::now();
        if self.bridge.is_due(now) {
            match self.bridge.flush(now).await {
                Ok(_) => report.published = true,
                Err(e) => warn!(error = %e, "Publish failed, retrying next cycle"),
            }
        }

        if self.consecutive_failures >= self.config.failure_threshold
            && self.state == SchedulerState::Polling
        {
            warn!(
                failures = self.consecutive_failures,
                "Device unreachable, backing off"
            );
            self.state = SchedulerState::Backoff;
        }

        debug!(
            read = report.fields_read,
            failed = report.fields_failed,
            published = report.published,
            "Poll cycle complete"
        );
        report
    }

    /// One reconnect attempt from backoff. Returns whether polling resumed.
    ///
    /// Commands that arrived while backing off are dropped and reported as
    /// failed rather than held until the device returns.
    pub async fn recover(&mut self) -> bool {
        self.drop_pending_controls().await;

        match self.devices.reconnect().await {
            Ok(()) => {
                info!(failures = self.backoff.failures(), "Device reachable again, resuming polling");
                self.backoff.reset();
                self.consecutive_failures = 0;
                self.state = SchedulerState::Polling;
                true
            }
            Err(e) => {
                let next = self.backoff.fail();
                warn!(error = %e, next_attempt = ?next, "Reconnect failed");
                false
            }
        }
    }

    async fn drop_pending_controls(&mut self) {
        let outcomes = self.dispatcher.discard();
        if outcomes.is_empty() {
            return;
        }
        self.bridge.stage_controls(&outcomes);
        if let Err(e) = self.bridge.flush(Instant::now()).await {
            warn!(error = %e, "Publish failed, retrying next cycle");
        }
    }

    /// Run until `shutdown` turns true or startup fails.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SchedulerError> {
        if *shutdown.borrow() {
            return Ok(());
        }

        let started = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => None,
            result = self.start() => Some(result),
        };
        match started {
            None => return self.stop().await,
            Some(Err(e)) => {
                error!(error = %e, "Scheduler could not start");
                self.devices.close().await;
                self.state = SchedulerState::Stopped;
                return Err(e);
            }
            Some(Ok(_)) => {}
        }

        // interval() panics on a zero period.
        let period = self.config.poll_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.state {
                SchedulerState::Backoff => {
                    let delay = self.backoff.current();
                    info!(delay = ?delay, "Waiting before reconnect");
                    tokio::select! {
                        biased;
                        _ = wait_for_shutdown(&mut shutdown) => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    let recovered = tokio::select! {
                        biased;
                        _ = wait_for_shutdown(&mut shutdown) => break,
                        recovered = self.recover() => recovered,
                    };
                    if recovered {
                        ticker.reset();
                    }
                }
                _ => {
                    tokio::select! {
                        biased;
                        _ = wait_for_shutdown(&mut shutdown) => break,
                        _ = ticker.tick() => {}
                    }

                    let grace = self.config.shutdown_grace;
                    let stopping = {
                        let cycle = self.poll_cycle();
                        tokio::pin!(cycle);
                        tokio::select! {
                            biased;
                            _ = &mut cycle => false,
                            _ = wait_for_shutdown(&mut shutdown) => {
                                info!(grace = ?grace, "Shutdown requested mid-cycle");
                                if tokio::time::timeout(grace, &mut cycle).await.is_err() {
                                    warn!("Poll cycle did not finish within the grace period, abandoning it");
                                }
                                true
                            }
                        }
                    };
                    if stopping {
                        break;
                    }
                }
            }
        }

        self.stop().await
    }

    async fn stop(&mut self) -> Result<(), SchedulerError> {
        self.state = SchedulerState::Stopping;
        self.devices.close().await;
        self.state = SchedulerState::Stopped;
        info!("Scheduler stopped");
        Ok(())
    }
}

/// Read every measurement field of one adapter into `readings`.
///
/// After the first communication failure the remaining fields of that
/// device are counted as failed without touching the link.
async fn read_fields<T: RegisterTransport>(
    adapter: &mut DeviceAdapter<T>,
    readings: &mut Vec<DeviceReading>,
) -> (usize, usize, Option<DeviceError>) {
    let fields = adapter.profile().fields.clone();
    let mut read = 0;
    let mut failed = 0;
    let mut last_error = None;
    let mut link_down = false;

    for field in &fields {
        if link_down {
            failed += 1;
            continue;
        }
        match adapter.read_field(field).await {
            Ok(reading) => {
                readings.push(reading);
                read += 1;
            }
            Err(e) => {
                warn!(device = %adapter.name(), field = %field.name, error = %e, "Field read failed");
                link_down = e.is_communication();
                failed += 1;
                last_error = Some(e);
            }
        }
    }

    (read, failed, last_error)
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also means shutdown.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use cryosight_bridge_framework::{Format, MemoryStore, Publisher, StoreKey};

    use crate::retry::RetryPolicy;
    use crate::sim::{SimDevice, SimTransport};

    fn scheduler(
        sim: &SimDevice,
        store: &MemoryStore,
        config: SchedulerConfig,
    ) -> PollScheduler<SimTransport, MemoryStore> {
        let adapter = DeviceAdapter::compressor("compressor", sim.transport())
            .with_retry(RetryPolicy::once())
            .with_io_timeout(Duration::from_millis(100));
        let publisher = Publisher::new(
            Arc::new(store.clone()),
            StoreKey::new("cryostat", "compressor").unwrap(),
            "compressor",
            Format::Json,
        );
        let bridge = TelemetryBridge::new(publisher, Vec::new(), Duration::ZERO);
        PollScheduler::new(
            config,
            DeviceSet::new(adapter),
            bridge,
            ControlKeysConfig::default(),
        )
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_millis(10),
            failure_threshold: 3,
            backoff_initial: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
            shutdown_grace: Duration::from_millis(200),
            startup_attempts: 2,
            initial_frequency_hz: None,
        }
    }

    #[tokio::test]
    async fn test_start_publishes_identity_and_readings() {
        let sim = SimDevice::cryomech_v3();
        let store = MemoryStore::new();
        let mut scheduler = scheduler(&sim, &store, fast_config());

        let report = scheduler.start().await.unwrap();
        assert!(report.published);
        assert_eq!(scheduler.state(), SchedulerState::Polling);

        let model = store.get_point("cryostat/compressor/model").unwrap();
        assert_eq!(model.value.as_text(), Some("CPA28I6"));
        let state = store.get_point("cryostat/compressor/state").unwrap();
        assert_eq!(state.value.as_text(), Some("Running"));
        assert!(store.get_point("cryostat/compressor/inverter_freq").is_some());
        assert_eq!(store.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_startup_failure() {
        let sim = SimDevice::cryomech_v3();
        sim.set_offline(true);
        let store = MemoryStore::new();
        let mut scheduler = scheduler(&sim, &store, fast_config());

        let err = scheduler.start().await.unwrap_err();
        assert!(matches!(err, SchedulerError::Startup { attempts: 2, .. }));
        assert_eq!(sim.connect_count(), 2);
        assert_eq!(store.put_count(), 0);
    }

    #[tokio::test]
    async fn test_initial_frequency_applied_on_start() {
        let sim = SimDevice::cryomech_v3();
        let store = MemoryStore::new();
        let config = SchedulerConfig {
            initial_frequency_hz: Some(58.0),
            ..fast_config()
        };
        let mut scheduler = scheduler(&sim, &store, config);

        let report = scheduler.start().await.unwrap();
        assert_eq!(report.commands_applied, 1);
        assert_eq!(sim.writes(), vec![(3, 580)]);
        let status = store.get_point("cryostat/compressor/control_status").unwrap();
        assert_eq!(status.value.as_text(), Some("ok"));
    }

    #[tokio::test]
    async fn test_threshold_moves_to_backoff() {
        let sim = SimDevice::cryomech_v3();
        let store = MemoryStore::new();
        let mut scheduler = scheduler(&sim, &store, fast_config());
        scheduler.start().await.unwrap();

        sim.set_offline(true);
        for _ in 0..2 {
            assert!(scheduler.poll_cycle().await.is_full_failure());
        }
        assert_eq!(scheduler.state(), SchedulerState::Polling);
        let comm = store.get_point("cryostat/compressor/comm_status").unwrap();
        assert_eq!(comm.value.as_text(), Some("connection error"));

        scheduler.poll_cycle().await;
        assert_eq!(scheduler.state(), SchedulerState::Backoff);

        assert!(!scheduler.recover().await);
        assert_eq!(scheduler.state(), SchedulerState::Backoff);

        sim.set_offline(false);
        assert!(scheduler.recover().await);
        assert_eq!(scheduler.state(), SchedulerState::Polling);
        assert_eq!(scheduler.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_partial_failure_is_not_a_failure() {
        let sim = SimDevice::cryomech_v3();
        let store = MemoryStore::new();
        let mut scheduler = scheduler(&sim, &store, fast_config());
        scheduler.start().await.unwrap();

        // First status register read fails; fields still arrive.
        sim.fail_next(1);
        let report = scheduler.poll_cycle().await;
        assert!(!report.is_full_failure());
        assert_eq!(scheduler.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let sim = SimDevice::cryomech_v3();
        let store = MemoryStore::new();
        let scheduler = scheduler(&sim, &store, fast_config());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(scheduler.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        handle.await.unwrap().unwrap();
        assert!(!sim.is_connected());
        assert!(sim.read_count() > 0);
    }
}
