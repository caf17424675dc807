use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

/// Serialization format for published telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// JSON format (human-readable, what most store readers expect).
    #[default]
    Json,

    /// CBOR format (compact binary).
    Cbor,
}

impl Format {
    /// Get the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Format::Json => "application/json",
            Format::Cbor => "application/cbor",
        }
    }
}

/// Encode a value to bytes using the specified format.
pub fn encode<T: Serialize>(value: &T, format: Format) -> Result<Vec<u8>> {
    match format {
        Format::Json => serde_json::to_vec(value).map_err(Error::from),
        Format::Cbor => {
            let mut buf = Vec::new();
            ciborium::into_writer(value, &mut buf)?;
            Ok(buf)
        }
    }
}

/// Decode bytes to a value using the specified format.
pub fn decode<T: DeserializeOwned>(data: &[u8], format: Format) -> Result<T> {
    match format {
        Format::Json => serde_json::from_slice(data).map_err(Error::from),
        Format::Cbor => ciborium::from_reader(data).map_err(|e| Error::Cbor(e.to_string())),
    }
}

/// Try to auto-detect the format from the data.
///
/// Anything that looks like a JSON document or scalar is treated as JSON,
/// everything else as CBOR. Control writers commonly send bare scalars such
/// as `1`, `true` or `"on"`.
pub fn detect_format(data: &[u8]) -> Format {
    match data.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'{' | b'[' | b'"' | b'-' | b'0'..=b'9' | b't' | b'f' | b'n') => Format::Json,
        _ => Format::Cbor,
    }
}

/// Decode bytes, auto-detecting the format.
pub fn decode_auto<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let format = detect_format(data);
    decode(data, format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{TelemetryPoint, TelemetryValue};

    fn sample() -> TelemetryPoint {
        TelemetryPoint::new("compressor", "warning_code", TelemetryValue::Integer(4))
            .with_label("unit", "")
    }

    #[test]
    fn test_cbor_preserves_point() {
        let point = sample();

        let encoded = encode(&point, Format::Cbor).unwrap();
        let decoded: TelemetryPoint = decode(&encoded, Format::Cbor).unwrap();

        assert_eq!(decoded.metric, "warning_code");
        assert_eq!(decoded.value, TelemetryValue::Integer(4));
        assert_eq!(decoded.timestamp, point.timestamp);
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(detect_format(b"{\"value\": 1}"), Format::Json);
        assert_eq!(detect_format(b"  [1, 2]"), Format::Json);
        assert_eq!(detect_format(b"60.5"), Format::Json);
        assert_eq!(detect_format(b"-1"), Format::Json);
        assert_eq!(detect_format(b"true"), Format::Json);
        assert_eq!(detect_format(b"\"on\""), Format::Json);
        assert_eq!(detect_format(b"\xa1\x65value\x01"), Format::Cbor);
    }

    #[test]
    fn test_auto_decode_both_formats() {
        let point = sample();

        let json = encode(&point, Format::Json).unwrap();
        let decoded: TelemetryPoint = decode_auto(&json).unwrap();
        assert_eq!(decoded.source, "compressor");

        let cbor = encode(&point, Format::Cbor).unwrap();
        let decoded: TelemetryPoint = decode_auto(&cbor).unwrap();
        assert_eq!(decoded.source, "compressor");
    }

    #[test]
    fn test_auto_decode_scalar() {
        let value: serde_json::Value = decode_auto(b"55.5").unwrap();
        assert_eq!(value.as_f64(), Some(55.5));
    }
}
