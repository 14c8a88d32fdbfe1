//! ISO-8601 duration formatting and parsing (`P..Y..M..W..DT..H..M..S`).
//!
//! Calendar units use the fixed lengths year = 365 days, month = 30 days.

use std::time::Duration;

use crate::error::{Error, Result};

const NANOS_PER_SEC: u128 = 1_000_000_000;
const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 60 * SECS_PER_MINUTE;
const SECS_PER_DAY: u64 = 24 * SECS_PER_HOUR;
const SECS_PER_WEEK: u64 = 7 * SECS_PER_DAY;
const SECS_PER_MONTH: u64 = 30 * SECS_PER_DAY;
const SECS_PER_YEAR: u64 = 365 * SECS_PER_DAY;

/// Formats a duration as an ISO-8601 duration string.
pub fn format_iso8601(duration: Duration) -> String {
    if duration.is_zero() {
        return "PT0S".to_string();
    }

    let mut result = String::from("P");
    let mut secs = duration.as_secs();
    let nanos = duration.subsec_nanos();

    for (unit, suffix) in [
        (SECS_PER_YEAR, 'Y'),
        (SECS_PER_MONTH, 'M'),
        (SECS_PER_WEEK, 'W'),
        (SECS_PER_DAY, 'D'),
    ] {
        let count = secs / unit;
        if count > 0 {
            result.push_str(&format!("{count}{suffix}"));
            secs %= unit;
        }
    }

    let hours = secs / SECS_PER_HOUR;
    secs %= SECS_PER_HOUR;
    let minutes = secs / SECS_PER_MINUTE;
    secs %= SECS_PER_MINUTE;

    if hours > 0 || minutes > 0 || secs > 0 || nanos > 0 {
        result.push('T');

        if hours > 0 {
            result.push_str(&format!("{hours}H"));
        }

        if minutes > 0 {
            result.push_str(&format!("{minutes}M"));
        }

        if nanos == 0 && secs > 0 {
            result.push_str(&format!("{secs}S"));
        } else if nanos > 0 {
            let rest = secs as f64 + f64::from(nanos) / 1e9;
            result.push_str(&format!("{rest:.9}S"));
        }
    }

    result
}

/// Parses an ISO-8601 duration string produced by [`format_iso8601`] or an
/// equivalent external source.
pub fn parse_iso8601(value: &str) -> Result<Duration> {
    let rest = value
        .strip_prefix('P')
        .ok_or_else(|| Error::invalid_argument(format!("bad duration: {value}")))?;

    if rest.is_empty() {
        return Err(Error::invalid_argument(format!("bad duration: {value}")));
    }

    let (date_part, time_part) = match rest.split_once('T') {
        Some((date, time)) => (date, Some(time)),
        None => (rest, None),
    };

    let mut total_nanos: u128 = 0;

    for (number, unit) in split_components(date_part)? {
        let secs = match unit {
            'Y' => SECS_PER_YEAR,
            'M' => SECS_PER_MONTH,
            'W' => SECS_PER_WEEK,
            'D' => SECS_PER_DAY,
            other => {
                return Err(Error::invalid_argument(format!("bad duration unit {other} in {value}")))
            }
        };

        let whole = number
            .parse::<u64>()
            .map_err(|_| Error::invalid_argument(format!("bad duration number in {value}")))?;

        total_nanos += u128::from(whole) * u128::from(secs) * NANOS_PER_SEC;
    }

    if let Some(time_part) = time_part {
        if time_part.is_empty() {
            return Err(Error::invalid_argument(format!("bad duration: {value}")));
        }

        for (number, unit) in split_components(time_part)? {
            match unit {
                'H' | 'M' => {
                    let secs = if unit == 'H' { SECS_PER_HOUR } else { SECS_PER_MINUTE };
                    let whole = number
                        .parse::<u64>()
                        .map_err(|_| Error::invalid_argument(format!("bad duration number in {value}")))?;

                    total_nanos += u128::from(whole) * u128::from(secs) * NANOS_PER_SEC;
                }
                'S' => {
                    let secs = number
                        .parse::<f64>()
                        .map_err(|_| Error::invalid_argument(format!("bad duration number in {value}")))?;
                    if secs < 0.0 {
                        return Err(Error::invalid_argument(format!("bad duration: {value}")));
                    }

                    total_nanos += (secs * 1e9).round() as u128;
                }
                other => {
                    return Err(Error::invalid_argument(format!("bad duration unit {other} in {value}")))
                }
            }
        }
    }

    let secs = (total_nanos / NANOS_PER_SEC) as u64;
    let nanos = (total_nanos % NANOS_PER_SEC) as u32;

    Ok(Duration::new(secs, nanos))
}

fn split_components(part: &str) -> Result<Vec<(&str, char)>> {
    let mut components = Vec::new();
    let mut start = 0;

    for (idx, ch) in part.char_indices() {
        if ch.is_ascii_alphabetic() {
            if idx == start {
                return Err(Error::invalid_argument(format!("bad duration component: {part}")));
            }

            components.push((&part[start..idx], ch));
            start = idx + 1;
        }
    }

    if start != part.len() {
        return Err(Error::invalid_argument(format!("bad duration component: {part}")));
    }

    Ok(components)
}

/// Serde adapter for durations stored as ISO-8601 strings in config files.
pub mod serde_iso8601 {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_iso8601(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;

        parse_iso8601(&value).map_err(serde::de::Error::custom)
    }
}
