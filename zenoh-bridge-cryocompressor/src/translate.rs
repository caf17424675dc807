//! Raw register values to semantic telemetry.
//!
//! Everything here is pure: no I/O, no clocks.

use std::collections::BTreeMap;
use std::fmt;

use crate::registers::Encoding;

/// Decoded register contents before scaling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawValue {
    Integer(i64),
    Float(f64),
    /// High byte, low byte.
    Bytes(i8, i8),
}

impl RawValue {
    /// Numeric view used for scaling. Byte pairs have none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RawValue::Integer(v) => Some(*v as f64),
            RawValue::Float(v) => Some(*v),
            RawValue::Bytes(..) => None,
        }
    }

    /// Integer view used for status codes; floats are truncated.
    pub fn as_code(&self) -> Option<i64> {
        match self {
            RawValue::Integer(v) => Some(*v),
            RawValue::Float(v) if v.is_finite() => Some(v.trunc() as i64),
            _ => None,
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Integer(v) => write!(f, "{}", v),
            RawValue::Float(v) => write!(f, "{}", v),
            RawValue::Bytes(hi, lo) => write!(f, "{}.{}", hi, lo),
        }
    }
}

fn low_word_first(regs: &[u16]) -> u32 {
    ((regs[1] as u32) << 16) | regs[0] as u32
}

/// Decode raw registers according to an encoding.
///
/// Returns a reason string when the register count does not match the
/// encoding or a float is not finite.
pub fn decode_registers(regs: &[u16], encoding: Encoding) -> Result<RawValue, String> {
    let expected = encoding.register_count() as usize;
    if regs.len() != expected {
        return Err(format!(
            "expected {} register(s) for {:?}, got {}",
            expected,
            encoding,
            regs.len()
        ));
    }

    let value = match encoding {
        Encoding::Uint16 => RawValue::Integer(regs[0] as i64),
        Encoding::Int16 => RawValue::Integer(regs[0] as i16 as i64),
        Encoding::Int32 | Encoding::Bitfield => {
            RawValue::Integer(low_word_first(regs) as i32 as i64)
        }
        Encoding::Float32 => {
            let value = f32::from_bits(low_word_first(regs));
            if !value.is_finite() {
                return Err(format!("non-finite float {}", value));
            }
            RawValue::Float(value as f64)
        }
        Encoding::BytePair => {
            let [hi, lo] = regs[0].to_be_bytes();
            RawValue::Bytes(hi as i8, lo as i8)
        }
    };
    Ok(value)
}

/// State names and alarm bit names used to decode a status snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusTable {
    pub states: BTreeMap<i64, String>,
    pub alarms: BTreeMap<u32, String>,
}

/// Alarm bits shared by the warning and error registers, in bit order.
const CRYOMECH_ALARMS: [&str; 31] = [
    "Coolant In High",
    "Coolant In Low",
    "Coolant Out High",
    "Coolant Out Low",
    "Oil High",
    "Oil Low",
    "Helium High",
    "Helium Low",
    "Low Pressure High",
    "Low Pressure Low",
    "High Pressure High",
    "High Pressure Low",
    "Delta Pressure High",
    "Delta Pressure Low",
    "Motor Current Low",
    "Three Phase Error",
    "Power Supply Error",
    "Static Pressure High",
    "Static Pressure Low",
    "Cold Head Motor Stall",
    "Coolant In Sensor",
    "Coolant Out Sensor",
    "Helium Sensor",
    "Oil Sensor",
    "High Pressure Sensor",
    "Low Pressure Sensor",
    "Motor Current Sensor",
    "Motor Current High",
    "Inverter Error",
    "Driver Comm Loss",
    "Inverter Comm Loss",
];

const CRYOMECH_STATES: [(i64, &str); 9] = [
    (0, "Ready to start"),
    (2, "Starting"),
    (3, "Running"),
    (5, "Stopping"),
    (6, "Error Lockout"),
    (7, "Error"),
    (8, "Helium Overtemp: waiting to cool down"),
    (9, "Power Related Error"),
    (15, "Recovered From Error"),
];

pub const UNKNOWN_STATE: &str = "Unknown State";
pub const NO_ALARMS: &str = "None";

impl Default for StatusTable {
    fn default() -> Self {
        Self {
            states: CRYOMECH_STATES
                .iter()
                .map(|(code, name)| (*code, name.to_string()))
                .collect(),
            alarms: CRYOMECH_ALARMS
                .iter()
                .enumerate()
                .map(|(bit, name)| (bit as u32, name.to_string()))
                .collect(),
        }
    }
}

impl StatusTable {
    /// A table with no state or alarm names.
    pub fn empty() -> Self {
        Self {
            states: BTreeMap::new(),
            alarms: BTreeMap::new(),
        }
    }

    pub fn with_state(mut self, code: i64, name: impl Into<String>) -> Self {
        self.states.insert(code, name.into());
        self
    }

    pub fn with_alarm(mut self, bit: u32, name: impl Into<String>) -> Self {
        self.alarms.insert(bit, name.into());
        self
    }

    pub fn state_name(&self, code: i64) -> &str {
        self.states.get(&code).map(String::as_str).unwrap_or(UNKNOWN_STATE)
    }

    /// Names of every set bit, highest bit first, joined by `", "`.
    ///
    /// Revision 2 panels report codes negated, so the magnitude is decoded.
    /// Bits without a name are ignored; no named bits renders as `"None"`.
    pub fn alarm_names(&self, code: i64) -> String {
        let magnitude = code.unsigned_abs();
        let names: Vec<&str> = self
            .alarms
            .iter()
            .rev()
            .filter(|(bit, _)| **bit < 64 && magnitude & (1u64 << **bit) != 0)
            .map(|(_, name)| name.as_str())
            .collect();

        if names.is_empty() {
            NO_ALARMS.to_string()
        } else {
            names.join(", ")
        }
    }
}

/// The four status registers as read in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub enabled: i64,
    pub state: i64,
    pub warning: i64,
    pub error: i64,
}

/// Decoded compressor status.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub enabled: i64,
    pub state_code: i64,
    pub state: String,
    pub warning_code: i64,
    pub warnings: String,
    pub error_code: i64,
    pub errors: String,
}

/// Decode a status snapshot. The `*_code` fields carry the raw values as-is.
pub fn decode_status(snapshot: &StatusSnapshot, table: &StatusTable) -> DeviceStatus {
    DeviceStatus {
        enabled: snapshot.enabled,
        state_code: snapshot.state,
        state: table.state_name(snapshot.state).to_string(),
        warning_code: snapshot.warning,
        warnings: table.alarm_names(snapshot.warning),
        error_code: snapshot.error,
        errors: table.alarm_names(snapshot.error),
    }
}

/// A scaled value and whether it looks physically reasonable for its unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scaled {
    pub value: f64,
    pub plausible: bool,
}

/// Apply `scale` to `raw`. Implausible values pass through unmodified and flagged.
pub fn scale(raw: f64, scale: f64, unit: Option<&str>) -> Scaled {
    let value = raw * scale;
    let plausible = value.is_finite()
        && match unit.and_then(plausible_range) {
            Some((min, max)) => (min..=max).contains(&value),
            None => true,
        };
    Scaled { value, plausible }
}

/// Range a healthy compressor can report in `unit`.
pub fn plausible_range(unit: &str) -> Option<(f64, f64)> {
    let range = match unit {
        "F" => (-60.0, 300.0),
        "C" => (-50.0, 150.0),
        "K" => (220.0, 425.0),
        "PSI" => (-15.0, 600.0),
        "Bar" => (-1.0, 42.0),
        "kPa" => (-100.0, 4200.0),
        "A" => (0.0, 200.0),
        "Hz" => (0.0, 120.0),
        "RPM" => (0.0, 10_000.0),
        "h" => (0.0, 1_000_000.0),
        "V" => (0.0, 1000.0),
        "kW" => (0.0, 100.0),
        _ => return None,
    };
    Some(range)
}

/// Temperature unit for the panel's temperature scale code.
pub fn temperature_unit(code: i64) -> Option<&'static str> {
    match code {
        0 => Some("F"),
        1 => Some("C"),
        2 => Some("K"),
        _ => None,
    }
}

/// Pressure unit for the panel's pressure scale code.
pub fn pressure_unit(code: i64) -> Option<&'static str> {
    match code {
        0 => Some("PSI"),
        1 => Some("Bar"),
        2 => Some("kPa"),
        _ => None,
    }
}

/// Model name from the model code register, e.g. `CPA28I6`.
///
/// Unknown family or variant bytes contribute nothing to the name.
pub fn decode_model(code: u16) -> String {
    let [family, variant] = code.to_be_bytes();

    let family = match family {
        1 => "08",
        2 => "09",
        3 => "10",
        4 => "11",
        5 => "28",
        _ => "",
    };
    let variant = match variant {
        1 => "A1",
        2 => "01",
        3 => "02",
        4 => "03",
        5 => "H3",
        6 => "I3",
        7 => "04",
        8 => "H4",
        9 => "05",
        10 => "H5",
        11 => "I6",
        12 => "06",
        13 => "07",
        14 => "H7",
        15 => "I7",
        16 => "08",
        17 => "09",
        18 => "9C",
        19 => "10",
        20 => "1I",
        21 => "11",
        22 => "12",
        23 => "13",
        24 => "14",
        _ => "",
    };

    format!("CPA{}{}", family, variant)
}

/// Software revision `major.minor` from its register.
pub fn decode_software_rev(register: u16) -> String {
    let [major, minor] = register.to_be_bytes();
    format!("{}.{}", major as i8, minor as i8)
}

/// Models that carry their own inverter on the panel bus.
pub fn has_internal_inverter(model: &str) -> bool {
    model == "CPA28I6"
}
