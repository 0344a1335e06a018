//! Human-friendly duration strings for the configuration model.
//!
//! Config files write timeouts the way the proxy's operators think about
//! them: `"200ms"`, `"1s"`, `"2m"`. This module parses that shape and
//! provides serde adapters for `Option<Duration>` fields.

use std::time::Duration;

/// Parse a duration of the form `<number><unit>` where unit is one of
/// `us`, `ms`, `s`, `m`, `h`. A bare number is taken as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| format!("invalid duration number: {input:?}"))?;
    let micros = match unit {
        "us" | "µs" => value,
        "ms" => value * 1_000.0,
        "" | "s" => value * 1_000_000.0,
        "m" => value * 60.0 * 1_000_000.0,
        "h" => value * 3_600.0 * 1_000_000.0,
        other => return Err(format!("unknown duration unit: {other:?}")),
    };
    if micros < 0.0 {
        return Err(format!("negative duration: {input:?}"));
    }
    Ok(Duration::from_micros(micros as u64))
}

/// Render a duration back into the most compact suffixed form.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let micros = d.as_micros();
    if micros == 0 {
        return "0s".to_string();
    }
    if micros % 1_000_000 == 0 {
        format!("{}s", micros / 1_000_000)
    } else if micros % 1_000 == 0 {
        format!("{}ms", micros / 1_000)
    } else {
        format!("{micros}us")
    }
}

/// Serde adapter for `Option<Duration>` fields encoded as suffixed strings.
pub mod option {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_some(&format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw {
            None => Ok(None),
            Some(s) => parse_duration(&s).map(Some).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_suffixed() {
        assert_eq!(parse_duration("200ms").unwrap(), Duration::from_millis(200));
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("50us").unwrap(), Duration::from_micros(50));
        assert_eq!(parse_duration("0.5s").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_bare_number_is_seconds() {
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("10fortnights").is_err());
    }

    #[test]
    fn test_format_round_trip() {
        for input in ["200ms", "1s", "90s", "250us"] {
            let d = parse_duration(input).unwrap();
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }
}
