//! Scalar value types used in configuration files.
//!
//! `Duration` and `Size` accept several literal forms:
//! a bare integer (whole seconds / bytes), a bare float (fractional seconds,
//! durations only) and a unit-suffixed string (`"10s"`, `"1.5d"`, `"12GiB"`).
//! Durations additionally accept compound expressions such as `"7d8h15m"`,
//! summing all terms left to right.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScalarParseError {
    #[error("invalid duration literal {0:?}")]
    Duration(String),
    #[error("unknown duration unit {unit:?} in {literal:?}")]
    DurationUnit { literal: String, unit: String },
    #[error("invalid size literal {0:?}")]
    Size(String),
    #[error("unknown size suffix in {0:?}")]
    SizeSuffix(String),
    #[error("value {0:?} is out of range")]
    OutOfRange(String),
}

/// A time span configured by the user.
///
/// Stored with nanosecond resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(std::time::Duration);

impl Duration {
    pub const ZERO: Duration = Duration(std::time::Duration::ZERO);

    pub fn from_secs(secs: u64) -> Self {
        Duration(std::time::Duration::from_secs(secs))
    }

    pub fn from_millis(millis: u64) -> Self {
        Duration(std::time::Duration::from_millis(millis))
    }

    pub fn from_nanos(nanos: u64) -> Self {
        Duration(std::time::Duration::from_nanos(nanos))
    }

    pub fn as_nanos(&self) -> u128 {
        self.0.as_nanos()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<std::time::Duration> for Duration {
    fn from(d: std::time::Duration) -> Self {
        Duration(d)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(d: Duration) -> Self {
        d.0
    }
}

/// Duration units accepted in string literals. `d` is a custom unit (24h)
/// that the standard vocabulary does not have.
const DURATION_UNITS: &[(&str, f64)] = &[
    ("ns", 1.0),
    ("us", 1_000.0),
    ("µs", 1_000.0),
    ("ms", 1_000_000.0),
    ("s", 1_000_000_000.0),
    ("m", 60_000_000_000.0),
    ("h", 3_600_000_000_000.0),
    ("d", 86_400_000_000_000.0),
];

fn trim_quotes(s: &str) -> &str {
    for quotes in ["'''", "\"\"\"", "'", "\""] {
        if s.len() >= 2 * quotes.len() && s.starts_with(quotes) && s.ends_with(quotes) {
            return &s[quotes.len()..s.len() - quotes.len()];
        }
    }
    s
}

impl FromStr for Duration {
    type Err = ScalarParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut s = trim_quotes(s.trim());
        if s.is_empty() {
            return Ok(Duration::ZERO);
        }
        // Legacy config files may contain "0d", which predates the custom
        // day unit. Normalize it so those files keep loading.
        if s == "0d" {
            s = "0h";
        }
        // Numeric strings count whole or fractional seconds.
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }
        if let Ok(secs) = s.parse::<f64>() {
            return nanos_from_float(secs * 1e9, s);
        }

        // Compound unit expression: one or more <number><unit> terms.
        let mut total = 0.0f64;
        let mut rest = s;
        while !rest.is_empty() {
            let num_len = rest
                .find(|c: char| !c.is_ascii_digit() && c != '.')
                .ok_or_else(|| ScalarParseError::Duration(s.to_owned()))?;
            if num_len == 0 {
                return Err(ScalarParseError::Duration(s.to_owned()));
            }
            let number: f64 = rest[..num_len]
                .parse()
                .map_err(|_| ScalarParseError::Duration(s.to_owned()))?;
            rest = &rest[num_len..];

            let unit_len = rest
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(rest.len());
            let unit = &rest[..unit_len];
            let factor = DURATION_UNITS
                .iter()
                .find(|(u, _)| *u == unit)
                .map(|(_, f)| *f)
                .ok_or_else(|| ScalarParseError::DurationUnit {
                    literal: s.to_owned(),
                    unit: unit.to_owned(),
                })?;
            total += number * factor;
            rest = &rest[unit_len..];
        }
        nanos_from_float(total, s)
    }
}

fn nanos_from_float(nanos: f64, literal: &str) -> Result<Duration, ScalarParseError> {
    if !nanos.is_finite() || nanos < 0.0 || nanos > u64::MAX as f64 {
        return Err(ScalarParseError::OutOfRange(literal.to_owned()));
    }
    Ok(Duration::from_nanos(nanos.round() as u64))
}

impl fmt::Display for Duration {
    /// Renders the compact form, e.g. `1h30m` or `2d12h`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut nanos = self.0.as_nanos();
        if nanos == 0 {
            return f.write_str("0s");
        }
        const TERMS: &[(&str, u128)] = &[
            ("d", 86_400_000_000_000),
            ("h", 3_600_000_000_000),
            ("m", 60_000_000_000),
            ("s", 1_000_000_000),
            ("ms", 1_000_000),
            ("us", 1_000),
            ("ns", 1),
        ];
        for (unit, factor) in TERMS {
            let count = nanos / factor;
            if count > 0 {
                write!(f, "{count}{unit}")?;
                nanos -= count * factor;
            }
        }
        Ok(())
    }
}

impl Serialize for Duration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_newtype_struct("Duration", &self.to_string())
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration (integer seconds, float seconds or a string like \"10s\")")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                u64::try_from(v)
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom(ScalarParseError::OutOfRange(v.to_string())))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
                nanos_from_float(v * 1e9, &v.to_string()).map_err(E::custom)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

/// A byte count configured by the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Size(u64);

impl Size {
    pub const ZERO: Size = Size(0);

    pub fn from_bytes(bytes: u64) -> Self {
        Size(bytes)
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }
}

/// Size suffixes, decimal (powers of 1000) and binary (powers of 1024).
/// Checked longest-first so `KiB` is not read as `B`.
const SIZE_SUFFIXES: &[(&str, u64)] = &[
    ("KiB", 1 << 10),
    ("MiB", 1 << 20),
    ("GiB", 1 << 30),
    ("TiB", 1 << 40),
    ("PiB", 1 << 50),
    ("EiB", 1 << 60),
    ("kB", 1_000),
    ("KB", 1_000),
    ("MB", 1_000_000),
    ("GB", 1_000_000_000),
    ("TB", 1_000_000_000_000),
    ("PB", 1_000_000_000_000_000),
    ("EB", 1_000_000_000_000_000_000),
    ("B", 1),
];

impl FromStr for Size {
    type Err = ScalarParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = trim_quotes(s.trim());
        if s.is_empty() {
            return Ok(Size::ZERO);
        }
        if let Ok(bytes) = s.parse::<u64>() {
            return Ok(Size(bytes));
        }

        let num_len = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| ScalarParseError::Size(s.to_owned()))?;
        if num_len == 0 {
            return Err(ScalarParseError::Size(s.to_owned()));
        }
        let number: f64 = s[..num_len]
            .parse()
            .map_err(|_| ScalarParseError::Size(s.to_owned()))?;
        let suffix = s[num_len..].trim();
        let factor = SIZE_SUFFIXES
            .iter()
            .find(|(suf, _)| *suf == suffix)
            .map(|(_, f)| *f)
            .ok_or_else(|| ScalarParseError::SizeSuffix(s.to_owned()))?;

        let bytes = number * factor as f64;
        if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
            return Err(ScalarParseError::OutOfRange(s.to_owned()));
        }
        Ok(Size(bytes.round() as u64))
    }
}

impl fmt::Display for Size {
    /// Renders with the largest suffix that divides the count exactly,
    /// preferring binary units, else the plain byte count.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("0");
        }
        const UNITS: &[(&str, u64)] = &[
            ("EiB", 1 << 60),
            ("PiB", 1 << 50),
            ("TiB", 1 << 40),
            ("GiB", 1 << 30),
            ("MiB", 1 << 20),
            ("KiB", 1 << 10),
            ("EB", 1_000_000_000_000_000_000),
            ("PB", 1_000_000_000_000_000),
            ("TB", 1_000_000_000_000),
            ("GB", 1_000_000_000),
            ("MB", 1_000_000),
            ("kB", 1_000),
        ];
        for (unit, factor) in UNITS {
            if self.0 % factor == 0 {
                return write!(f, "{}{}", self.0 / factor, unit);
            }
        }
        write!(f, "{}", self.0)
    }
}

impl Serialize for Size {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_newtype_struct("Size", &self.to_string())
    }
}

impl<'de> Deserialize<'de> for Size {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SizeVisitor;

        impl Visitor<'_> for SizeVisitor {
            type Value = Size;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a size (integer bytes or a string like \"12GiB\")")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Size, E> {
                u64::try_from(v)
                    .map(Size)
                    .map_err(|_| E::custom(ScalarParseError::OutOfRange(v.to_string())))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Size, E> {
                Ok(Size(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Size, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SizeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn dur(s: &str) -> Duration {
        s.parse().unwrap()
    }

    #[test]
    fn duration_integer_seconds() {
        assert_eq!(dur("10"), Duration::from_secs(10));
        assert_eq!(dur("0"), Duration::ZERO);
    }

    #[test]
    fn duration_fractional_seconds() {
        assert_eq!(dur("1.5"), Duration::from_millis(1500));
        assert_eq!(dur("0.25"), Duration::from_millis(250));
    }

    #[test]
    fn duration_unit_strings() {
        assert_eq!(dur("10s"), Duration::from_secs(10));
        assert_eq!(dur("300ms"), Duration::from_millis(300));
        assert_eq!(dur("1.5d"), Duration::from_secs(36 * 3600));
        assert_eq!(dur("1h"), Duration::from_secs(3600));
        assert_eq!(dur("1µs"), Duration::from_nanos(1000));
    }

    #[test]
    fn duration_compound_expressions() {
        assert_eq!(dur("7d8h15m"), Duration::from_secs(7 * 86400 + 8 * 3600 + 15 * 60));
        assert_eq!(dur("1h30m10s"), Duration::from_secs(5410));
    }

    #[test]
    fn duration_legacy_zero_days() {
        // "0d" predates the day unit and must keep parsing to zero.
        assert_eq!(dur("0d"), Duration::ZERO);
    }

    #[test]
    fn duration_quoted_literals() {
        assert_eq!(dur("'10s'"), Duration::from_secs(10));
        assert_eq!(dur("\"1h\""), Duration::from_secs(3600));
        assert_eq!(dur("'''5m'''"), Duration::from_secs(300));
    }

    #[test]
    fn duration_empty_is_zero() {
        assert_eq!(dur(""), Duration::ZERO);
    }

    #[test]
    fn duration_rejects_garbage() {
        assert!("1x".parse::<Duration>().is_err());
        assert!("abc".parse::<Duration>().is_err());
        assert!("h1".parse::<Duration>().is_err());
    }

    #[test]
    fn duration_renders_compact() {
        assert_eq!(dur("7d8h15m").to_string(), "7d8h15m");
        assert_eq!(Duration::ZERO.to_string(), "0s");
        assert_eq!(Duration::from_millis(1500).to_string(), "1s500ms");
    }

    #[test]
    fn duration_display_round_trips() {
        for input in ["10s", "1.5d", "7d8h15m", "300ms", "0s"] {
            let parsed = dur(input);
            assert_eq!(dur(&parsed.to_string()), parsed, "round-trip of {input}");
        }
    }

    #[test]
    fn duration_from_toml_values() {
        #[derive(serde::Deserialize)]
        struct Conf {
            interval: Duration,
        }
        let c: Conf = toml::from_str("interval = 5").unwrap();
        assert_eq!(c.interval, Duration::from_secs(5));
        let c: Conf = toml::from_str("interval = 1.5").unwrap();
        assert_eq!(c.interval, Duration::from_millis(1500));
        let c: Conf = toml::from_str("interval = \"7d8h15m\"").unwrap();
        assert_eq!(c.interval, dur("7d8h15m"));
    }

    fn size(s: &str) -> Size {
        s.parse().unwrap()
    }

    #[test]
    fn size_integer_bytes() {
        assert_eq!(size("1024"), Size::from_bytes(1024));
    }

    #[test]
    fn size_binary_suffixes() {
        assert_eq!(size("12GiB"), Size::from_bytes(12 * 1024 * 1024 * 1024));
        assert_eq!(size("1KiB"), Size::from_bytes(1024));
    }

    #[test]
    fn size_decimal_suffixes() {
        assert_eq!(size("5MB"), Size::from_bytes(5_000_000));
        assert_eq!(size("3kB"), Size::from_bytes(3000));
    }

    #[test]
    fn size_fractional() {
        assert_eq!(size("1.5KiB"), Size::from_bytes(1536));
    }

    #[test]
    fn size_rejects_garbage() {
        assert!("12XiB".parse::<Size>().is_err());
        assert!("GiB".parse::<Size>().is_err());
    }

    #[test]
    fn size_renders_largest_exact_unit() {
        assert_eq!(size("12GiB").to_string(), "12GiB");
        assert_eq!(size("5MB").to_string(), "5MB");
        assert_eq!(Size::from_bytes(1234).to_string(), "1234");
    }

    #[test]
    fn size_from_toml_values() {
        #[derive(serde::Deserialize)]
        struct Conf {
            max: Size,
        }
        let c: Conf = toml::from_str("max = 4096").unwrap();
        assert_eq!(c.max, Size::from_bytes(4096));
        let c: Conf = toml::from_str("max = \"32MiB\"").unwrap();
        assert_eq!(c.max, Size::from_bytes(32 << 20));
    }
}
