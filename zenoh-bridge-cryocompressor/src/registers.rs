//! Register maps.
//!
//! Cryomech CPA digital panels expose their measurements as Modbus input
//! registers. Two layouts exist: software revision 2 panels report 32-bit
//! floats, revision 3 panels report 16-bit integers in tenths. The identity
//! registers are shared by both and decide which layout applies.
//!
//! Multi-register values are transmitted low word first.

use serde::{Deserialize, Serialize};

use crate::translate::StatusTable;

/// Serial number (uint16).
pub const SERIAL_ADDR: u16 = 31;
/// Model code, family in the high byte and variant in the low byte.
pub const MODEL_ADDR: u16 = 32;
/// Software revision as two signed bytes, major first.
pub const SOFTWARE_REV_ADDR: u16 = 33;
/// Pressure scale code (0 PSI, 1 Bar, 2 kPa).
pub const PRESSURE_SCALE_ADDR: u16 = 29;
/// Temperature scale code (0 F, 1 C, 2 K).
pub const TEMPERATURE_SCALE_ADDR: u16 = 30;

/// Holding register that switches the compressor on and off.
pub const ENABLE_ADDR: u16 = 1;
pub const POWER_ON: u16 = 0x0001;
pub const POWER_OFF: u16 = 0x00FF;

/// Accepted inverter frequency setpoints in Hz.
pub const MIN_FREQUENCY_HZ: f64 = 40.0;
pub const MAX_FREQUENCY_HZ: f64 = 70.0;

/// Modbus register table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    /// Input registers (read-only, 16-bit)
    Input,
    /// Holding registers (read/write, 16-bit)
    Holding,
}

impl RegisterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterKind::Input => "input",
            RegisterKind::Holding => "holding",
        }
    }
}

/// How the raw registers of a field are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Uint16,
    Int16,
    /// Two registers, low word first.
    Int32,
    /// IEEE 754 single precision, low word first.
    Float32,
    /// 32-bit status code, two registers low word first.
    Bitfield,
    /// Two 8-bit values packed into one register.
    BytePair,
}

impl Encoding {
    /// Number of 16-bit registers occupied.
    pub fn register_count(&self) -> u16 {
        match self {
            Encoding::Uint16 | Encoding::Int16 | Encoding::BytePair => 1,
            Encoding::Int32 | Encoding::Float32 | Encoding::Bitfield => 2,
        }
    }
}

/// Physical unit of a field.
///
/// Temperatures and pressures follow the scale configured on the panel, so
/// their unit is only known after the identity read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    None,
    Fixed(String),
    Temperature,
    Pressure,
}

impl Unit {
    pub fn fixed(unit: impl Into<String>) -> Self {
        Unit::Fixed(unit.into())
    }

    /// Resolve against the panel's configured scales.
    pub fn resolve(&self, temperature: Option<&str>, pressure: Option<&str>) -> Option<String> {
        match self {
            Unit::None => None,
            Unit::Fixed(unit) => Some(unit.clone()),
            Unit::Temperature => temperature.map(str::to_string),
            Unit::Pressure => pressure.map(str::to_string),
        }
    }
}

/// Static description of one logical field.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterField {
    pub name: String,
    pub address: u16,
    pub encoding: Encoding,
    /// Multiplies the raw value.
    pub scale: f64,
    pub unit: Unit,
    pub kind: RegisterKind,
}

impl RegisterField {
    /// An unscaled, unitless input register field.
    pub fn input(name: impl Into<String>, address: u16, encoding: Encoding) -> Self {
        Self {
            name: name.into(),
            address,
            encoding,
            scale: 1.0,
            unit: Unit::None,
            kind: RegisterKind::Input,
        }
    }

    /// An unscaled, unitless holding register field.
    pub fn holding(name: impl Into<String>, address: u16, encoding: Encoding) -> Self {
        Self {
            kind: RegisterKind::Holding,
            ..Self::input(name, address, encoding)
        }
    }

    pub fn scaled(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    pub fn register_count(&self) -> u16 {
        self.encoding.register_count()
    }
}

/// The four registers that make up one status snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRegisters {
    pub enabled: RegisterField,
    pub state: RegisterField,
    pub warning: RegisterField,
    pub error: RegisterField,
}

/// Power switch register and the values that mean on and off.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerControl {
    pub register: RegisterField,
    pub on: u16,
    pub off: u16,
}

/// Frequency setpoint register; the field's scale converts Hz to raw.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyControl {
    pub register: RegisterField,
    pub min_hz: f64,
    pub max_hz: f64,
}

/// Everything the daemon knows about one device's registers.
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub name: String,
    /// Measurement fields read every cycle.
    pub fields: Vec<RegisterField>,
    pub status: Option<StatusRegisters>,
    pub status_table: StatusTable,
    pub power: Option<PowerControl>,
    pub frequency: Option<FrequencyControl>,
}

impl DeviceProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            status: None,
            status_table: StatusTable::default(),
            power: None,
            frequency: None,
        }
    }

    pub fn with_field(mut self, field: RegisterField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_status(mut self, status: StatusRegisters) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_status_table(mut self, table: StatusTable) -> Self {
        self.status_table = table;
        self
    }

    pub fn with_power(mut self, power: PowerControl) -> Self {
        self.power = Some(power);
        self
    }

    pub fn with_frequency(mut self, frequency: FrequencyControl) -> Self {
        self.frequency = Some(frequency);
        self
    }

    pub fn field(&self, name: &str) -> Option<&RegisterField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Add the internal inverter registers (software revision 3 only).
    pub fn with_internal_inverter(self) -> Self {
        self.with_field(
            RegisterField::input("inverter_freq", 36, Encoding::Int16)
                .scaled(0.1)
                .with_unit(Unit::fixed("Hz")),
        )
        .with_field(
            RegisterField::input("inverter_curr", 37, Encoding::Int16)
                .scaled(0.1)
                .with_unit(Unit::fixed("A")),
        )
        .with_field(
            RegisterField::holding("inverter_set_freq", 3, Encoding::Int16)
                .scaled(0.1)
                .with_unit(Unit::fixed("Hz")),
        )
        .with_frequency(FrequencyControl {
            register: RegisterField::holding("inverter_set_freq", 3, Encoding::Uint16)
                .scaled(0.1)
                .with_unit(Unit::fixed("Hz")),
            min_hz: MIN_FREQUENCY_HZ,
            max_hz: MAX_FREQUENCY_HZ,
        })
    }
}

fn power_control() -> PowerControl {
    PowerControl {
        register: RegisterField::holding("power", ENABLE_ADDR, Encoding::Uint16),
        on: POWER_ON,
        off: POWER_OFF,
    }
}

/// Software revision 2 layout: 32-bit floats, codes reported negated.
pub fn cryomech_v2() -> DeviceProfile {
    let float = |name: &str, address: u16, unit: Unit| {
        RegisterField::input(name, address, Encoding::Float32).with_unit(unit)
    };

    DeviceProfile::new("cryomech-v2")
        .with_status(StatusRegisters {
            state: RegisterField::input("state_code", 1, Encoding::Uint16),
            enabled: RegisterField::input("enabled", 2, Encoding::Uint16),
            warning: RegisterField::input("warning_code", 3, Encoding::Float32),
            error: RegisterField::input("error_code", 5, Encoding::Float32),
        })
        .with_field(float("coolant_in", 7, Unit::Temperature))
        .with_field(float("coolant_out", 9, Unit::Temperature))
        .with_field(float("oil_temp", 11, Unit::Temperature))
        .with_field(float("helium_temp", 13, Unit::Temperature))
        .with_field(float("low_pressure", 15, Unit::Pressure))
        .with_field(float("low_pressure_average", 17, Unit::Pressure))
        .with_field(float("high_pressure", 19, Unit::Pressure))
        .with_field(float("high_pressure_average", 21, Unit::Pressure))
        .with_field(float("delta_pressure_average", 23, Unit::Pressure))
        .with_field(float("motor_current", 25, Unit::fixed("A")))
        .with_field(float("hours", 27, Unit::fixed("h")))
        .with_power(power_control())
}

/// Software revision 3 layout: 16-bit integers in tenths.
pub fn cryomech_v3() -> DeviceProfile {
    let tenths = |name: &str, address: u16, unit: Unit| {
        RegisterField::input(name, address, Encoding::Int16)
            .scaled(0.1)
            .with_unit(unit)
    };

    DeviceProfile::new("cryomech-v3")
        .with_status(StatusRegisters {
            state: RegisterField::input("state_code", 1, Encoding::Uint16),
            enabled: RegisterField::input("enabled", 2, Encoding::Uint16),
            warning: RegisterField::input("warning_code", 52, Encoding::Bitfield),
            error: RegisterField::input("error_code", 54, Encoding::Bitfield),
        })
        .with_field(tenths("coolant_in", 40, Unit::Temperature))
        .with_field(tenths("coolant_out", 41, Unit::Temperature))
        .with_field(tenths("oil_temp", 42, Unit::Temperature))
        .with_field(tenths("helium_temp", 43, Unit::Temperature))
        .with_field(tenths("low_pressure", 44, Unit::Pressure))
        .with_field(tenths("low_pressure_average", 45, Unit::Pressure))
        .with_field(tenths("high_pressure", 46, Unit::Pressure))
        .with_field(tenths("high_pressure_average", 47, Unit::Pressure))
        .with_field(tenths("delta_pressure_average", 48, Unit::Pressure))
        .with_field(tenths("motor_current", 49, Unit::fixed("A")))
        .with_field(
            RegisterField::input("hours", 50, Encoding::Int32)
                .scaled(0.1)
                .with_unit(Unit::fixed("h")),
        )
        .with_field(
            RegisterField::input("coldhead_rpm", 34, Encoding::Int16)
                .scaled(0.01)
                .with_unit(Unit::fixed("RPM")),
        )
        .with_field(RegisterField::input("software_variant", 35, Encoding::Uint16))
        .with_power(power_control())
}

/// External RS485 drive inverter; everything lives in holding registers.
pub fn external_inverter() -> DeviceProfile {
    DeviceProfile::new("rs485-inverter")
        .with_field(
            RegisterField::holding("inverter_freq", 0x1001, Encoding::Int32)
                .scaled(0.01)
                .with_unit(Unit::fixed("Hz")),
        )
        .with_field(
            RegisterField::holding("inverter_curr", 0x1002, Encoding::Uint16)
                .scaled(0.1)
                .with_unit(Unit::fixed("A")),
        )
        .with_field(
            RegisterField::holding("inverter_voltage", 0x1010, Encoding::Uint16)
                .scaled(0.1)
                .with_unit(Unit::fixed("V")),
        )
        .with_field(
            RegisterField::holding("inverter_power", 0x1011, Encoding::Uint16)
                .scaled(0.1)
                .with_unit(Unit::fixed("kW")),
        )
        .with_field(
            RegisterField::holding("inverter_set_freq", 0x0001, Encoding::Int32)
                .scaled(0.01)
                .with_unit(Unit::fixed("Hz")),
        )
        .with_frequency(FrequencyControl {
            register: RegisterField::holding("inverter_set_freq", 0x0001, Encoding::Uint16)
                .scaled(0.01)
                .with_unit(Unit::fixed("Hz")),
            min_hz: MIN_FREQUENCY_HZ,
            max_hz: MAX_FREQUENCY_HZ,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_counts() {
        assert_eq!(Encoding::Float32.register_count(), 2);
        assert_eq!(Encoding::Bitfield.register_count(), 2);
        assert_eq!(Encoding::BytePair.register_count(), 1);
    }

    #[test]
    fn test_v2_and_v3_cover_same_measurements() {
        let v2 = cryomech_v2();
        let v3 = cryomech_v3();
        for field in &v2.fields {
            assert!(v3.field(&field.name).is_some(), "{} missing from v3", field.name);
        }
        assert!(v3.field("coldhead_rpm").is_some());
        assert!(v2.field("coldhead_rpm").is_none());
    }

    #[test]
    fn test_no_overlapping_input_registers() {
        for profile in [cryomech_v2(), cryomech_v3()] {
            let mut used = Vec::new();
            for field in profile.fields.iter().filter(|f| f.kind == RegisterKind::Input) {
                for addr in field.address..field.address + field.register_count() {
                    assert!(!used.contains(&addr), "{}: register {} reused", profile.name, addr);
                    used.push(addr);
                }
            }
        }
    }

    #[test]
    fn test_internal_inverter_adds_frequency_control() {
        let profile = cryomech_v3().with_internal_inverter();
        let control = profile.frequency.as_ref().unwrap();
        assert_eq!(control.register.address, 3);
        assert_eq!(control.register.kind, RegisterKind::Holding);
        assert!(profile.field("inverter_freq").is_some());
    }

    #[test]
    fn test_unit_resolution() {
        assert_eq!(Unit::Temperature.resolve(Some("K"), Some("PSI")).as_deref(), Some("K"));
        assert_eq!(Unit::Pressure.resolve(Some("K"), Some("PSI")).as_deref(), Some("PSI"));
        assert_eq!(Unit::fixed("A").resolve(None, None).as_deref(), Some("A"));
        assert_eq!(Unit::None.resolve(Some("F"), Some("Bar")), None);
    }
}
