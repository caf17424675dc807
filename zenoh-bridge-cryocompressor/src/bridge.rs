//! Maps device readings onto `{table}/{key}/{field}` and publishes them.

use std::sync::Arc;
use std::time::Duration;

use cryosight_bridge_framework::{
    BridgeError, FieldMap, FieldValue, PublishStats, Publisher, StoreSample, TelemetryStore,
    TelemetryValue,
};
use cryosight_common::current_timestamp_millis;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{ControlKeysConfig, LoggedField};
use crate::control::{ControlCommand, ControlKey, ControlOutcome, Mailbox};
use crate::device::{DeviceReading, Identity};
use crate::translate::{DeviceStatus, NO_ALARMS};

/// Fields every publish carries regardless of `logged_fields`.
pub mod fields {
    pub const COMM_STATUS: &str = "comm_status";
    pub const COMM_ERROR: &str = "comm_error";
    pub const CONTROL_STATUS: &str = "control_status";
    pub const CONTROL_ERROR: &str = "control_error";
    pub const SUSPECT_READINGS: &str = "suspect_readings";

    pub const COMM_GOOD: &str = "good";
    pub const COMM_FAILED: &str = "connection error";
}

/// Pending telemetry for one `{table}/{key}`.
///
/// Readings are staged as they arrive; a later reading of the same field
/// replaces the earlier one. [`flush`](Self::flush) publishes everything
/// staged once the logging interval has elapsed and keeps it staged if the
/// store refuses it.
pub struct TelemetryBridge<S> {
    publisher: Publisher<S>,
    logged_fields: Vec<LoggedField>,
    logging_interval: Duration,
    pending: FieldMap,
    last_publish: Option<Instant>,
}

impl<S: TelemetryStore> TelemetryBridge<S> {
    /// An empty `logged_fields` publishes everything.
    pub fn new(
        publisher: Publisher<S>,
        logged_fields: Vec<LoggedField>,
        logging_interval: Duration,
    ) -> Self {
        Self {
            publisher,
            logged_fields,
            logging_interval,
            pending: FieldMap::new(),
            last_publish: None,
        }
    }

    pub fn publisher(&self) -> &Publisher<S> {
        &self.publisher
    }

    pub fn pending(&self) -> &FieldMap {
        &self.pending
    }

    /// Stage a value under its map name, applying `logged_fields`.
    pub fn stage(&mut self, name: &str, value: FieldValue) {
        if self.logged_fields.is_empty() {
            self.pending.insert(name.to_string(), value);
            return;
        }

        let Some(logged) = self.logged_fields.iter().find(|f| f.name == name) else {
            return;
        };
        let value = match &logged.unit {
            Some(unit) => FieldValue::with_unit(value.value, unit),
            None => value,
        };
        self.pending.insert(logged.store_name().to_string(), value);
    }

    /// Stage a daemon field that bypasses `logged_fields`.
    fn stage_reserved(&mut self, name: &str, value: impl Into<TelemetryValue>) {
        self.pending.insert(name.to_string(), FieldValue::new(value));
    }

    pub fn stage_reading(&mut self, reading: &DeviceReading) {
        let value = match &reading.unit {
            Some(unit) => FieldValue::with_unit(reading.translated_value.clone(), unit),
            None => FieldValue::new(reading.translated_value.clone()),
        };
        self.stage(&reading.field_name, value);
    }

    /// Stage a cycle's readings plus the list of implausible ones.
    pub fn stage_readings(&mut self, readings: &[DeviceReading]) {
        for reading in readings {
            self.stage_reading(reading);
        }

        let suspect: Vec<&str> = readings
            .iter()
            .filter(|r| !r.plausible)
            .map(|r| r.field_name.as_str())
            .collect();
        let suspect = if suspect.is_empty() {
            NO_ALARMS.to_string()
        } else {
            suspect.join(", ")
        };
        self.stage_reserved(fields::SUSPECT_READINGS, suspect);
    }

    pub fn stage_status(&mut self, status: &DeviceStatus) {
        self.stage("enabled", FieldValue::new(status.enabled));
        self.stage("state_code", FieldValue::new(status.state_code));
        self.stage("state", FieldValue::new(status.state.as_str()));
        self.stage("warning_code", FieldValue::new(status.warning_code));
        self.stage("warnings", FieldValue::new(status.warnings.as_str()));
        self.stage("error_code", FieldValue::new(status.error_code));
        self.stage("errors", FieldValue::new(status.errors.as_str()));
    }

    pub fn stage_identity(&mut self, identity: &Identity) {
        self.stage("serial_number", FieldValue::new(identity.serial_number as i64));
        self.stage("model", FieldValue::new(identity.model.as_str()));
        self.stage("software_rev", FieldValue::new(identity.software_rev.as_str()));
    }

    /// Stage `comm_status` and `comm_error`.
    pub fn stage_comm(&mut self, error: Option<&str>) {
        match error {
            None => {
                self.stage_reserved(fields::COMM_STATUS, fields::COMM_GOOD);
                self.stage_reserved(fields::COMM_ERROR, NO_ALARMS);
            }
            Some(error) => {
                self.stage_reserved(fields::COMM_STATUS, fields::COMM_FAILED);
                self.stage_reserved(fields::COMM_ERROR, error);
            }
        }
    }

    /// Stage `control_status` and `control_error` for one cycle's commands.
    ///
    /// The worst outcome sets the status and every error is listed, so a
    /// failed command is never masked by a later success.
    pub fn stage_controls(&mut self, outcomes: &[ControlOutcome]) {
        let Some(worst) = outcomes.iter().max_by_key(|o| o.severity()) else {
            return;
        };
        let errors: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.is_ok())
            .map(ControlOutcome::error)
            .collect();
        let error = if errors.is_empty() {
            NO_ALARMS.to_string()
        } else {
            errors.join("; ")
        };
        self.stage_reserved(fields::CONTROL_STATUS, worst.status());
        self.stage_reserved(fields::CONTROL_ERROR, error);
    }

    /// The first publish is always due.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_publish {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.logging_interval,
        }
    }

    /// Publish everything staged.
    ///
    /// On failure the staged fields are kept and the publish stays due, so
    /// the next cycle retries the whole map.
    pub async fn flush(&mut self, now: Instant) -> Result<PublishStats, BridgeError> {
        if self.pending.is_empty() {
            self.last_publish = Some(now);
            return Ok(PublishStats::default());
        }

        let stats = self
            .publisher
            .publish_fields(&self.pending, current_timestamp_millis())
            .await?;

        debug!(
            store_key = %self.publisher.store_key(),
            fields = stats.success,
            "Published telemetry"
        );
        self.pending.clear();
        self.last_publish = Some(now);
        Ok(stats)
    }

    /// Route writes to the control subkeys into `mailbox`.
    pub async fn subscribe_controls(
        &self,
        mailbox: &Mailbox,
        keys: &ControlKeysConfig,
    ) -> Result<(), BridgeError> {
        for key in ControlKey::ALL {
            let subkey = match key {
                ControlKey::Power => &keys.power,
                ControlKey::Frequency => &keys.frequency,
            };
            let mailbox = mailbox.clone();
            let callback = Arc::new(move |sample: StoreSample| {
                let command = ControlCommand::from_payload(key, &sample.payload);
                if let Some(replaced) = mailbox.post(command) {
                    warn!(
                        control = %key,
                        dropped = %replaced.requested_value,
                        "Control command superseded before it was applied"
                    );
                }
            });
            self.publisher.subscribe_field(subkey, callback).await?;
            debug!(control = %key, key = %self.publisher.store_key().field(subkey), "Subscribed to control key");
        }
        Ok(())
    }
}
