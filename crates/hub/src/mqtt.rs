//! Payload parsers for inbound sensor and device topics.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

/// One reading of the greenhouse climate sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct EnvironmentReading {
    pub(crate) temperature: f64,
    pub(crate) humidity: f64,
}

#[derive(Debug, Error, PartialEq)]
pub(crate) enum PayloadError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("payload has no '{0}' field")]
    MissingField(&'static str),
    #[error("'{field}' is not a number: {text:?}")]
    InvalidNumber { field: &'static str, text: String },
    #[error("unknown device status '{0}' (expected 1/0 or ON/OFF)")]
    UnknownStatus(String),
}

static TEMPERATURE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Suhu:\s*(-?\d+\.?\d*)").expect("static regex"));
static HUMIDITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Kelembaban:\s*(-?\d+\.?\d*)").expect("static regex"));

// ---------------------------------------------------------------------------
// Payload parsers
// ---------------------------------------------------------------------------

/// Parse the composite climate string `"Suhu: <float>\nKelembaban: <float>"`.
///
/// Both fields must be present. Field order and surrounding text are not
/// significant.
pub(crate) fn parse_environment(payload: &[u8]) -> Result<EnvironmentReading, PayloadError> {
    let text = std::str::from_utf8(payload).map_err(|_| PayloadError::NotUtf8)?;
    let temperature = capture_number(&TEMPERATURE_RE, text, "Suhu")?;
    let humidity = capture_number(&HUMIDITY_RE, text, "Kelembaban")?;
    Ok(EnvironmentReading {
        temperature,
        humidity,
    })
}

fn capture_number(re: &Regex, text: &str, field: &'static str) -> Result<f64, PayloadError> {
    let raw = re
        .captures(text)
        .and_then(|c| c.get(1))
        .ok_or(PayloadError::MissingField(field))?
        .as_str();
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(PayloadError::InvalidNumber {
            field,
            text: raw.to_string(),
        }),
    }
}

/// Parse a plain numeric payload (nutrient sensors, chart feeds).
pub(crate) fn parse_number(payload: &[u8]) -> Result<f64, PayloadError> {
    let text = std::str::from_utf8(payload).map_err(|_| PayloadError::NotUtf8)?;
    let trimmed = text.trim();
    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(PayloadError::InvalidNumber {
            field: "value",
            text: trimmed.to_string(),
        }),
    }
}

/// Parse a device status payload into on/off. Accepts the command encoding
/// (`"1"`/`"0"`) as well as `ON`/`OFF`, case-insensitive, whitespace trimmed.
pub(crate) fn parse_device_status(payload: &[u8]) -> Result<bool, PayloadError> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    match s.as_str() {
        "1" | "ON" => Ok(true),
        "0" | "OFF" => Ok(false),
        _ => Err(PayloadError::UnknownStatus(s)),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- parse_environment ---------------------------------------------------

    #[test]
    fn environment_valid_payload() {
        let r = parse_environment(b"Suhu: 26.5\nKelembaban: 65.3").unwrap();
        assert_eq!(r.temperature, 26.5);
        assert_eq!(r.humidity, 65.3);
    }

    #[test]
    fn environment_negative_and_integer_values() {
        let r = parse_environment(b"Suhu: -3\nKelembaban: 80").unwrap();
        assert_eq!(r.temperature, -3.0);
        assert_eq!(r.humidity, 80.0);
    }

    #[test]
    fn environment_no_space_after_colon() {
        let r = parse_environment(b"Suhu:21.0 Kelembaban:40.5").unwrap();
        assert_eq!(r.temperature, 21.0);
        assert_eq!(r.humidity, 40.5);
    }

    #[test]
    fn environment_fields_in_any_order() {
        let r = parse_environment(b"Kelembaban: 55\nSuhu: 30.25").unwrap();
        assert_eq!(r.temperature, 30.25);
        assert_eq!(r.humidity, 55.0);
    }

    #[test]
    fn environment_non_numeric_temperature_rejected() {
        assert_eq!(
            parse_environment(b"Suhu: abc"),
            Err(PayloadError::MissingField("Suhu"))
        );
    }

    #[test]
    fn environment_missing_humidity_rejected() {
        assert_eq!(
            parse_environment(b"Suhu: 26.5"),
            Err(PayloadError::MissingField("Kelembaban"))
        );
    }

    #[test]
    fn environment_empty_payload_rejected() {
        assert!(parse_environment(b"").is_err());
    }

    #[test]
    fn environment_invalid_utf8_rejected() {
        assert_eq!(
            parse_environment(&[0xff, 0xfe, 0x00]),
            Err(PayloadError::NotUtf8)
        );
    }

    // -- parse_number --------------------------------------------------------

    #[test]
    fn number_with_whitespace() {
        assert_eq!(parse_number(b" 6.2\n"), Ok(6.2));
    }

    #[test]
    fn number_garbage_rejected() {
        assert!(matches!(
            parse_number(b"n/a"),
            Err(PayloadError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn number_nan_rejected() {
        assert!(parse_number(b"NaN").is_err());
    }

    // -- parse_device_status -------------------------------------------------

    #[test]
    fn device_status_command_encoding() {
        assert_eq!(parse_device_status(b"1"), Ok(true));
        assert_eq!(parse_device_status(b"0"), Ok(false));
    }

    #[test]
    fn device_status_words_mixed_case() {
        assert_eq!(parse_device_status(b" on "), Ok(true));
        assert_eq!(parse_device_status(b"oFf"), Ok(false));
    }

    #[test]
    fn device_status_garbage() {
        assert!(parse_device_status(b"TOGGLE").is_err());
        assert!(parse_device_status(b"").is_err());
    }
}
