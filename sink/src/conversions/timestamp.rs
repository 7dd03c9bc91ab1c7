use chrono::{DateTime, NaiveDateTime, Utc};

use crate::bail;
use crate::error::{ErrorKind, SinkResult};
use crate::types::{DocumentValue, Hlc};

/// Format of SQL-style timestamps without an offset, interpreted as UTC.
const NAIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Parses a textual timestamp.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]` in UTC, HLC strings, and bare integers, which
/// are Unix epoch seconds like their numeric counterparts.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, NAIVE_TIMESTAMP_FORMAT) {
        return Some(parsed.and_utc());
    }
    if let Some(hlc) = parse_hlc(raw) {
        return Some(hlc.to_datetime());
    }

    raw.parse::<i64>()
        .ok()
        .and_then(|seconds| DateTime::from_timestamp(seconds, 0))
}

/// Parses an HLC string. The `.<logical>` part is required, so bare integers never read as
/// nanoseconds.
pub fn parse_hlc(raw: &str) -> Option<Hlc> {
    if !raw.contains('.') {
        return None;
    }

    raw.parse().ok()
}

/// Coerces a document value into a UTC timestamp.
///
/// Numbers are Unix epoch seconds, with fractional seconds honored. Strings are parsed with
/// [`parse_timestamp`]. Returns `None` for null, which callers treat as "no timestamp".
pub fn coerce_timestamp(value: &DocumentValue) -> SinkResult<Option<DateTime<Utc>>> {
    match value {
        DocumentValue::Null => Ok(None),
        DocumentValue::Number(number) => {
            let Some(seconds) = number.as_f64() else {
                bail!(
                    ErrorKind::InvalidData,
                    "Timestamp is out of range",
                    format!("{number} cannot be represented as epoch seconds")
                );
            };

            let whole = seconds.floor();
            let nanos = ((seconds - whole) * 1_000_000_000.0).round() as u32;
            match DateTime::from_timestamp(whole as i64, nanos.min(999_999_999)) {
                Some(timestamp) => Ok(Some(timestamp)),
                None => bail!(
                    ErrorKind::InvalidData,
                    "Timestamp is out of range",
                    format!("{number} cannot be represented as epoch seconds")
                ),
            }
        }
        DocumentValue::String(raw) => match parse_timestamp(raw) {
            Some(timestamp) => Ok(Some(timestamp)),
            None => bail!(
                ErrorKind::InvalidData,
                "Invalid timestamp",
                format!("`{raw}` is not RFC 3339, `YYYY-MM-DD HH:MM:SS`, HLC, or epoch seconds")
            ),
        },
        other => bail!(
            ErrorKind::InvalidData,
            "Value cannot be coerced to a timestamp",
            format!("found {}", other.type_name())
        ),
    }
}
