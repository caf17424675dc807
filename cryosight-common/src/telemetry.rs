use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

/// A single telemetry field as published to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryPoint {
    /// Unix epoch milliseconds when the measurement was taken.
    pub timestamp: i64,

    /// Device identifier (e.g., "compressor", "inverter").
    pub source: String,

    /// Field name (e.g., "helium_temp", "warning_code").
    pub metric: String,

    /// The measured value.
    pub value: TelemetryValue,

    /// Additional context labels (e.g., unit, register address).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl TelemetryPoint {
    /// Create a new telemetry point with the current timestamp.
    pub fn new(source: impl Into<String>, metric: impl Into<String>, value: TelemetryValue) -> Self {
        Self {
            timestamp: current_timestamp_millis(),
            source: source.into(),
            metric: metric.into(),
            value,
            labels: HashMap::new(),
        }
    }

    /// Override the timestamp.
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add a label to this telemetry point.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// The `unit` label, if any.
    pub fn unit(&self) -> Option<&str> {
        self.labels.get("unit").map(String::as_str)
    }
}

/// Typed telemetry value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TelemetryValue {
    /// Integer value (status codes, enable flags, counters).
    Integer(i64),

    /// Floating point measurement.
    Gauge(f64),

    /// Boolean value.
    Boolean(bool),

    /// Text value (decoded state, warning lists, errors).
    Text(String),
}

impl TelemetryValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TelemetryValue::Integer(v) => Some(*v as f64),
            TelemetryValue::Gauge(v) => Some(*v),
            TelemetryValue::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
            TelemetryValue::Text(_) => None,
        }
    }

    /// Text view of the value, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            TelemetryValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for TelemetryValue {
    fn from(v: i64) -> Self {
        TelemetryValue::Integer(v)
    }
}

impl From<i32> for TelemetryValue {
    fn from(v: i32) -> Self {
        TelemetryValue::Integer(v as i64)
    }
}

impl From<f64> for TelemetryValue {
    fn from(v: f64) -> Self {
        TelemetryValue::Gauge(v)
    }
}

impl From<String> for TelemetryValue {
    fn from(v: String) -> Self {
        TelemetryValue::Text(v)
    }
}

impl From<&str> for TelemetryValue {
    fn from(v: &str) -> Self {
        TelemetryValue::Text(v.to_string())
    }
}

impl From<bool> for TelemetryValue {
    fn from(v: bool) -> Self {
        TelemetryValue::Boolean(v)
    }
}

/// A field value together with its unit.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldValue {
    pub value: TelemetryValue,
    pub unit: Option<String>,
}

impl FieldValue {
    pub fn new(value: impl Into<TelemetryValue>) -> Self {
        Self {
            value: value.into(),
            unit: None,
        }
    }

    pub fn with_unit(value: impl Into<TelemetryValue>, unit: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            unit: Some(unit.into()),
        }
    }
}

/// The set of fields published for one `{table}/{key}` in one cycle.
///
/// Ordered so that publishes are deterministic.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Get the current timestamp in milliseconds since Unix epoch.
///
/// Returns 0 if system time is before Unix epoch.
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_point_creation() {
        let point = TelemetryPoint::new("compressor", "helium_temp", TelemetryValue::Gauge(75.4))
            .with_label("unit", "F")
            .at(1_700_000_000_000);

        assert_eq!(point.source, "compressor");
        assert_eq!(point.metric, "helium_temp");
        assert_eq!(point.value, TelemetryValue::Gauge(75.4));
        assert_eq!(point.unit(), Some("F"));
        assert_eq!(point.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_untagged_integer_before_gauge() {
        let v: TelemetryValue = serde_json::from_str("4").unwrap();
        assert_eq!(v, TelemetryValue::Integer(4));

        let v: TelemetryValue = serde_json::from_str("4.5").unwrap();
        assert_eq!(v, TelemetryValue::Gauge(4.5));

        let v: TelemetryValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, TelemetryValue::Boolean(true));

        let v: TelemetryValue = serde_json::from_str("\"Running\"").unwrap();
        assert_eq!(v.as_text(), Some("Running"));
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(TelemetryValue::from(-4i32), TelemetryValue::Integer(-4));
        assert_eq!(TelemetryValue::from(59.5), TelemetryValue::Gauge(59.5));
        assert_eq!(TelemetryValue::from("None").as_text(), Some("None"));
        assert_eq!(TelemetryValue::from(true).as_f64(), Some(1.0));
        assert_eq!(TelemetryValue::from("x").as_f64(), None);
    }

    #[test]
    fn test_field_map_is_ordered() {
        let mut fields = FieldMap::new();
        fields.insert("warnings".into(), FieldValue::new("None"));
        fields.insert("coolant_in".into(), FieldValue::with_unit(61.2, "F"));

        let names: Vec<_> = fields.keys().cloned().collect();
        assert_eq!(names, vec!["coolant_in", "warnings"]);
        assert_eq!(fields["coolant_in"].unit.as_deref(), Some("F"));
    }
}
