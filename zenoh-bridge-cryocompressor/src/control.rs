//! Remote control commands.
//!
//! Subscription callbacks run on the store's delivery threads. They only
//! parse the payload and post it into the [`Mailbox`]; the scheduler drains
//! the mailbox at the start of each cycle and applies the commands through
//! the device adapters, so control writes never interleave with a poll.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use cryosight_common::{TelemetryPoint, current_timestamp_millis, decode_auto};
use serde_json::Value;
use tracing::{info, warn};

use crate::device::DeviceSet;
use crate::error::DeviceError;
use crate::registers::{MAX_FREQUENCY_HZ, MIN_FREQUENCY_HZ};
use crate::transport::RegisterTransport;

/// Remotely controllable setpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ControlKey {
    Power,
    Frequency,
}

impl ControlKey {
    pub const ALL: [ControlKey; 2] = [ControlKey::Power, ControlKey::Frequency];

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlKey::Power => "power",
            ControlKey::Frequency => "frequency",
        }
    }
}

impl std::fmt::Display for ControlKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a command asks the device to do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlAction {
    Power(bool),
    Frequency(f64),
}

/// A command as received from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlCommand {
    pub key: ControlKey,
    pub requested_value: Value,
    pub received_at: i64,
}

impl ControlCommand {
    pub fn new(key: ControlKey, requested_value: impl Into<Value>) -> Self {
        Self {
            key,
            requested_value: requested_value.into(),
            received_at: current_timestamp_millis(),
        }
    }

    /// Build a command from a raw store payload.
    ///
    /// Accepts a telemetry point, a bare JSON or CBOR value, or plain text.
    pub fn from_payload(key: ControlKey, payload: &[u8]) -> Self {
        let value = if let Ok(point) = decode_auto::<TelemetryPoint>(payload) {
            serde_json::to_value(point.value).unwrap_or(Value::Null)
        } else if let Ok(value) = decode_auto::<Value>(payload) {
            value
        } else {
            Value::String(String::from_utf8_lossy(payload).trim().to_string())
        };
        Self::new(key, value)
    }

    /// Interpret the requested value for this command's key.
    pub fn action(&self) -> Result<ControlAction, String> {
        match self.key {
            ControlKey::Power => parse_power(&self.requested_value).map(ControlAction::Power),
            ControlKey::Frequency => {
                parse_frequency(&self.requested_value).map(ControlAction::Frequency)
            }
        }
    }
}

fn parse_power(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(on) => Ok(*on),
        Value::Number(n) => n
            .as_f64()
            .map(|v| v != 0.0)
            .ok_or_else(|| format!("invalid power value {}", n)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "1" | "yes" => Ok(true),
            "off" | "false" | "0" | "no" => Ok(false),
            other => Err(format!("invalid power value '{}'", other)),
        },
        other => Err(format!("invalid power value {}", other)),
    }
}

fn parse_frequency(value: &Value) -> Result<f64, String> {
    let hz = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|hz| hz.is_finite())
    .ok_or_else(|| format!("invalid frequency {}", value))?;

    if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&hz) {
        return Err(format!(
            "{} Hz outside {}-{} Hz",
            hz, MIN_FREQUENCY_HZ, MAX_FREQUENCY_HZ
        ));
    }
    Ok(hz)
}

/// One pending command per key; a newer command replaces an older one.
#[derive(Debug, Clone, Default)]
pub struct Mailbox {
    slots: Arc<Mutex<BTreeMap<ControlKey, ControlCommand>>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, BTreeMap<ControlKey, ControlCommand>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Post a command. Returns the command it replaced, if any.
    pub fn post(&self, command: ControlCommand) -> Option<ControlCommand> {
        self.slots().insert(command.key, command)
    }

    /// Take every pending command, in key order.
    pub fn drain(&self) -> Vec<ControlCommand> {
        std::mem::take(&mut *self.slots()).into_values().collect()
    }

    pub fn is_pending(&self, key: ControlKey) -> bool {
        self.slots().contains_key(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }
}

/// Per-key dispatch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    CommandReceived,
    Applying,
}

/// How an applied command turned out.
#[derive(Debug)]
pub struct ControlOutcome {
    pub command: ControlCommand,
    pub result: Result<(), DeviceError>,
}

impl ControlOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Short status for the `control_status` field.
    pub fn status(&self) -> &'static str {
        match &self.result {
            Ok(()) => "ok",
            Err(e) if e.is_rejection() => "rejected",
            Err(_) => "failed",
        }
    }

    /// Ordering for combining outcomes: a failure outranks a rejection,
    /// which outranks success.
    pub fn severity(&self) -> u8 {
        match &self.result {
            Ok(()) => 0,
            Err(e) if e.is_rejection() => 1,
            Err(_) => 2,
        }
    }

    /// Message for the `control_error` field.
    pub fn error(&self) -> String {
        match &self.result {
            Ok(()) => "None".to_string(),
            Err(e) => e.to_string(),
        }
    }
}

/// Applies mailbox commands at the scheduler's safe point.
#[derive(Debug, Default)]
pub struct ControlDispatcher {
    mailbox: Mailbox,
    applying: Option<ControlKey>,
}

impl ControlDispatcher {
    pub fn new(mailbox: Mailbox) -> Self {
        Self {
            mailbox,
            applying: None,
        }
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn state(&self, key: ControlKey) -> DispatchState {
        if self.applying == Some(key) {
            DispatchState::Applying
        } else if self.mailbox.is_pending(key) {
            DispatchState::CommandReceived
        } else {
            DispatchState::Idle
        }
    }

    /// Apply at most one command per key. Failed commands are not retried.
    pub async fn dispatch<T: RegisterTransport>(
        &mut self,
        devices: &mut DeviceSet<T>,
    ) -> Vec<ControlOutcome> {
        let mut outcomes = Vec::new();

        for command in self.mailbox.drain() {
            self.applying = Some(command.key);

            let result = match command.action() {
                Ok(ControlAction::Power(on)) => devices.set_power(on).await,
                Ok(ControlAction::Frequency(hz)) => devices.set_frequency(hz).await,
                Err(reason) => Err(DeviceError::rejected(command.key.as_str(), reason)),
            };

            match &result {
                Ok(()) => info!(
                    control = %command.key,
                    value = %command.requested_value,
                    "Control command applied"
                ),
                Err(e) => warn!(
                    control = %command.key,
                    value = %command.requested_value,
                    error = %e,
                    "Control command not applied"
                ),
            }

            self.applying = None;
            outcomes.push(ControlOutcome { command, result });
        }

        outcomes
    }

    /// Drop every pending command without touching the device.
    pub fn discard(&mut self) -> Vec<ControlOutcome> {
        self.mailbox
            .drain()
            .into_iter()
            .map(|command| {
                warn!(
                    control = %command.key,
                    value = %command.requested_value,
                    "Device unreachable, dropping control command"
                );
                let field = command.key.as_str().to_string();
                ControlOutcome {
                    command,
                    result: Err(DeviceError::Unreachable { field }),
                }
            })
            .collect()
    }
}
