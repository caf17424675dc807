//! Device adapter: typed field access over a [`RegisterTransport`].
//!
//! The adapter owns its transport exclusively. Every call is bounded by the
//! I/O timeout and retried according to the [`RetryPolicy`]; exception
//! responses are never retried. A connection fault drops the connection and
//! the next attempt reconnects lazily.

use std::time::Duration;

use cryosight_common::{TelemetryValue, current_timestamp_millis};
use tracing::{debug, info, warn};

use crate::config::{CryoBridgeConfig, InverterConfig};
use crate::error::{DeviceError, TransportError};
use crate::registers::{
    self, DeviceProfile, MODEL_ADDR, PRESSURE_SCALE_ADDR, RegisterField, RegisterKind,
    SERIAL_ADDR, SOFTWARE_REV_ADDR, TEMPERATURE_SCALE_ADDR,
};
use crate::retry::RetryPolicy;
use crate::translate::{
    self, RawValue, StatusSnapshot, StatusTable, decode_model, decode_registers,
    decode_software_rev, has_internal_inverter, pressure_unit, temperature_unit,
};
use crate::transport::RegisterTransport;

/// One translated field value.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReading {
    pub field_name: String,
    pub raw_value: RawValue,
    pub translated_value: TelemetryValue,
    pub unit: Option<String>,
    pub timestamp: i64,
    /// False when the value is outside the physical range of its unit.
    pub plausible: bool,
}

/// What the panel reports about itself at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub serial_number: u16,
    pub model_code: u16,
    pub model: String,
    pub software_rev: String,
    pub temperature_unit: Option<&'static str>,
    pub pressure_unit: Option<&'static str>,
}

impl Identity {
    fn from_registers(serial: u16, model: u16, rev: u16, temperature: u16, pressure: u16) -> Self {
        Self {
            serial_number: serial,
            model_code: model,
            model: decode_model(model),
            software_rev: decode_software_rev(rev),
            temperature_unit: temperature_unit(temperature as i64),
            pressure_unit: pressure_unit(pressure as i64),
        }
    }

    /// Revision 3 panels use the integer register layout.
    pub fn is_v3(&self) -> bool {
        self.software_rev.starts_with('3')
    }

    /// Register layout for this panel.
    pub fn profile(&self, internal_inverter: bool) -> DeviceProfile {
        if self.is_v3() {
            let profile = registers::cryomech_v3();
            if internal_inverter || has_internal_inverter(&self.model) {
                profile.with_internal_inverter()
            } else {
                profile
            }
        } else {
            registers::cryomech_v2()
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Request {
    Read {
        kind: RegisterKind,
        address: u16,
        count: u16,
    },
    Write {
        address: u16,
        value: u16,
    },
}

/// Typed access to one Modbus device.
#[derive(Debug)]
pub struct DeviceAdapter<T> {
    name: String,
    transport: T,
    retry: RetryPolicy,
    io_timeout: Duration,
    profile: DeviceProfile,
    /// Replace the profile from the identity registers.
    auto_profile: bool,
    internal_inverter: bool,
    temperature_unit: Option<String>,
    pressure_unit: Option<String>,
    identity: Option<Identity>,
}

impl<T: RegisterTransport> DeviceAdapter<T> {
    /// Adapter with a fixed register profile.
    pub fn new(name: impl Into<String>, transport: T, profile: DeviceProfile) -> Self {
        Self {
            name: name.into(),
            transport,
            retry: RetryPolicy::default(),
            io_timeout: Duration::from_secs(3),
            profile,
            auto_profile: false,
            internal_inverter: false,
            temperature_unit: None,
            pressure_unit: None,
            identity: None,
        }
    }

    /// Adapter for a Cryomech panel; [`identify`](Self::identify) picks the layout.
    pub fn compressor(name: impl Into<String>, transport: T) -> Self {
        Self {
            auto_profile: true,
            ..Self::new(name, transport, registers::cryomech_v3())
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Read the panel's inverter registers even if the model code does not imply them.
    pub fn with_internal_inverter(mut self, enabled: bool) -> Self {
        self.internal_inverter = enabled;
        self
    }

    /// Pin the register profile; identification still resolves units.
    pub fn with_profile(mut self, profile: DeviceProfile) -> Self {
        self.profile = profile;
        self.auto_profile = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn status_table(&self) -> &StatusTable {
        &self.profile.status_table
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Read the identity registers and select the register layout.
    pub async fn identify(&mut self) -> Result<Identity, DeviceError> {
        let serial = self.read_word("serial_number", SERIAL_ADDR).await?;
        let model = self.read_word("model", MODEL_ADDR).await?;
        let rev = self.read_word("software_rev", SOFTWARE_REV_ADDR).await?;
        let temperature = self.read_word("temperature_scale", TEMPERATURE_SCALE_ADDR).await?;
        let pressure = self.read_word("pressure_scale", PRESSURE_SCALE_ADDR).await?;

        let identity = Identity::from_registers(serial, model, rev, temperature, pressure);
        if self.auto_profile {
            self.profile = identity.profile(self.internal_inverter);
        }
        self.temperature_unit = identity.temperature_unit.map(str::to_string);
        self.pressure_unit = identity.pressure_unit.map(str::to_string);

        info!(
            device = %self.name,
            serial = identity.serial_number,
            model = %identity.model,
            software_rev = %identity.software_rev,
            profile = %self.profile.name,
            "Device identified"
        );

        self.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Read a field of the current profile by name.
    pub async fn read(&mut self, name: &str) -> Result<DeviceReading, DeviceError> {
        let field = self
            .profile
            .field(name)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownField(name.to_string()))?;
        self.read_field(&field).await
    }

    pub async fn read_field(&mut self, field: &RegisterField) -> Result<DeviceReading, DeviceError> {
        let regs = self
            .call(
                &field.name,
                Request::Read {
                    kind: field.kind,
                    address: field.address,
                    count: field.register_count(),
                },
            )
            .await?;
        let raw = decode_registers(&regs, field.encoding)
            .map_err(|reason| DeviceError::translation(&field.name, reason))?;

        let unit = field
            .unit
            .resolve(self.temperature_unit.as_deref(), self.pressure_unit.as_deref());

        let (translated_value, plausible) = match (raw, raw.as_f64()) {
            (RawValue::Integer(v), _) if field.scale == 1.0 => {
                let scaled = translate::scale(v as f64, 1.0, unit.as_deref());
                (TelemetryValue::Integer(v), scaled.plausible)
            }
            (_, Some(v)) => {
                let scaled = translate::scale(v, field.scale, unit.as_deref());
                (TelemetryValue::Gauge(scaled.value), scaled.plausible)
            }
            (_, None) => (TelemetryValue::Text(raw.to_string()), true),
        };

        if !plausible {
            debug!(device = %self.name, field = %field.name, raw = %raw, "Implausible reading");
        }

        Ok(DeviceReading {
            field_name: field.name.clone(),
            raw_value: raw,
            translated_value,
            unit,
            timestamp: current_timestamp_millis(),
            plausible,
        })
    }

    /// Read the four status registers as one snapshot.
    ///
    /// Returns `None` when the profile has no status registers. Any failed
    /// read fails the whole snapshot.
    pub async fn read_status(&mut self) -> Result<Option<StatusSnapshot>, DeviceError> {
        let Some(status) = self.profile.status.clone() else {
            return Ok(None);
        };

        Ok(Some(StatusSnapshot {
            enabled: self.read_code(&status.enabled).await?,
            state: self.read_code(&status.state).await?,
            warning: self.read_code(&status.warning).await?,
            error: self.read_code(&status.error).await?,
        }))
    }

    /// Write `value` in physical units; the field's scale converts it to raw.
    pub async fn write(&mut self, field: &RegisterField, value: f64) -> Result<(), DeviceError> {
        let raw = (value / field.scale).round();
        if !raw.is_finite() || raw < 0.0 || raw > u16::MAX as f64 {
            return Err(DeviceError::rejected(
                &field.name,
                format!("{} does not fit a 16-bit register", value),
            ));
        }
        self.write_raw(field, raw as u16).await
    }

    pub async fn write_raw(&mut self, field: &RegisterField, raw: u16) -> Result<(), DeviceError> {
        if field.kind != RegisterKind::Holding {
            return Err(DeviceError::rejected(&field.name, "not a holding register"));
        }
        self.call(
            &field.name,
            Request::Write {
                address: field.address,
                value: raw,
            },
        )
        .await?;
        debug!(device = %self.name, field = %field.name, address = field.address, raw, "Register written");
        Ok(())
    }

    /// Switch the compressor on or off.
    pub async fn set_power(&mut self, on: bool) -> Result<(), DeviceError> {
        let control = self
            .profile
            .power
            .clone()
            .ok_or_else(|| DeviceError::rejected("power", format!("{} has no power control", self.name)))?;
        let raw = if on { control.on } else { control.off };
        self.write_raw(&control.register, raw).await
    }

    /// Set the inverter frequency in Hz.
    pub async fn set_frequency(&mut self, hz: f64) -> Result<(), DeviceError> {
        let control = self.profile.frequency.clone().ok_or_else(|| {
            DeviceError::rejected("frequency", format!("{} has no frequency control", self.name))
        })?;
        if !(control.min_hz..=control.max_hz).contains(&hz) {
            return Err(DeviceError::rejected(
                &control.register.name,
                format!("{} Hz outside {}-{} Hz", hz, control.min_hz, control.max_hz),
            ));
        }
        self.write(&control.register, hz).await
    }

    pub fn has_frequency_control(&self) -> bool {
        self.profile.frequency.is_some()
    }

    /// Drop the current connection and open a new one.
    pub async fn reconnect(&mut self) -> Result<(), DeviceError> {
        self.transport.close().await;
        self.attempt_connect()
            .await
            .map_err(|source| DeviceError::Communication {
                field: "connect".to_string(),
                attempts: 1,
                source,
            })
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }

    async fn read_word(&mut self, name: &str, address: u16) -> Result<u16, DeviceError> {
        let regs = self
            .call(
                name,
                Request::Read {
                    kind: RegisterKind::Input,
                    address,
                    count: 1,
                },
            )
            .await?;
        regs.first()
            .copied()
            .ok_or_else(|| DeviceError::translation(name, "empty response"))
    }

    async fn read_code(&mut self, field: &RegisterField) -> Result<i64, DeviceError> {
        let regs = self
            .call(
                &field.name,
                Request::Read {
                    kind: field.kind,
                    address: field.address,
                    count: field.register_count(),
                },
            )
            .await?;
        decode_registers(&regs, field.encoding)
            .map_err(|reason| DeviceError::translation(&field.name, reason))?
            .as_code()
            .ok_or_else(|| DeviceError::translation(&field.name, "not an integer code"))
    }

    async fn attempt_connect(&mut self) -> Result<(), TransportError> {
        let timeout = self.io_timeout;
        tokio::time::timeout(timeout, self.transport.connect())
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }

    async fn attempt(&mut self, request: Request) -> Result<Vec<u16>, TransportError> {
        if !self.transport.is_connected() {
            self.attempt_connect().await?;
        }

        let timeout = self.io_timeout;
        let transport = &mut self.transport;
        let call = async move {
            match request {
                Request::Read {
                    kind,
                    address,
                    count,
                } => transport.read_registers(kind, address, count).await,
                Request::Write { address, value } => {
                    transport.write_register(address, value).await.map(|()| Vec::new())
                }
            }
        };
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }

    async fn call(&mut self, field: &str, request: Request) -> Result<Vec<u16>, DeviceError> {
        let attempts = self.retry.attempts;
        let mut last_error = TransportError::NotConnected;

        for attempt in 1..=attempts {
            match self.attempt(request).await {
                Ok(regs) => return Ok(regs),
                Err(e) if !e.is_retryable() => {
                    let reason = match e {
                        TransportError::Rejected(reason) => reason,
                        other => other.to_string(),
                    };
                    return Err(DeviceError::rejected(field, reason));
                }
                Err(e) => {
                    if e.drops_connection() {
                        self.transport.close().await;
                    }
                    debug!(
                        device = %self.name,
                        field = %field,
                        attempt,
                        error = %e,
                        "Transport call failed"
                    );
                    last_error = e;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.retry.delay_after(attempt)).await;
            }
        }

        warn!(
            device = %self.name,
            endpoint = %self.transport.endpoint(),
            field = %field,
            attempts,
            error = %last_error,
            "Giving up on device call"
        );
        Err(DeviceError::Communication {
            field: field.to_string(),
            attempts,
            source: last_error,
        })
    }
}

/// The compressor and, when configured, a separately connected inverter.
#[derive(Debug)]
pub struct DeviceSet<T> {
    pub compressor: DeviceAdapter<T>,
    pub inverter: Option<DeviceAdapter<T>>,
}

impl<T: RegisterTransport> DeviceSet<T> {
    pub fn new(compressor: DeviceAdapter<T>) -> Self {
        Self {
            compressor,
            inverter: None,
        }
    }

    /// Build the adapters described by `config` over the given transports.
    ///
    /// `inverter` is only used when the config declares an external inverter.
    pub fn from_config(config: &CryoBridgeConfig, compressor: T, inverter: Option<T>) -> Self {
        let internal = matches!(config.inverter, Some(InverterConfig::Internal { .. }));
        let adapter = DeviceAdapter::compressor("compressor", compressor)
            .with_retry(config.compressor.retry_policy())
            .with_io_timeout(config.compressor.io_timeout())
            .with_internal_inverter(internal);
        let mut devices = Self::new(adapter);

        if let (Some(InverterConfig::External { device, .. }), Some(transport)) =
            (&config.inverter, inverter)
        {
            devices = devices.with_inverter(
                DeviceAdapter::new("inverter", transport, registers::external_inverter())
                    .with_retry(device.retry_policy())
                    .with_io_timeout(device.io_timeout()),
            );
        }
        devices
    }

    pub fn with_inverter(mut self, inverter: DeviceAdapter<T>) -> Self {
        self.inverter = Some(inverter);
        self
    }

    pub async fn set_power(&mut self, on: bool) -> Result<(), DeviceError> {
        self.compressor.set_power(on).await
    }

    /// Route a frequency setpoint to whichever device drives the motor.
    pub async fn set_frequency(&mut self, hz: f64) -> Result<(), DeviceError> {
        match self.inverter.as_mut() {
            Some(inverter) => inverter.set_frequency(hz).await,
            None => self.compressor.set_frequency(hz).await,
        }
    }

    pub fn adapters_mut(&mut self) -> impl Iterator<Item = &mut DeviceAdapter<T>> {
        std::iter::once(&mut self.compressor).chain(self.inverter.as_mut())
    }

    pub async fn reconnect(&mut self) -> Result<(), DeviceError> {
        self.compressor.reconnect().await?;
        if let Some(inverter) = self.inverter.as_mut() {
            if let Err(e) = inverter.reconnect().await {
                warn!(device = %inverter.name(), error = %e, "Inverter reconnect failed");
            }
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        for adapter in self.adapters_mut() {
            adapter.close().await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.compressor.is_connected()
            || self.inverter.as_ref().is_some_and(DeviceAdapter::is_connected)
    }
}
