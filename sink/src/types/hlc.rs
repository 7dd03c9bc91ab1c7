use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::error::{ErrorKind, SinkError, SinkResult};
use crate::sink_error;

/// A hybrid logical clock timestamp: wall time in nanoseconds plus a logical counter.
///
/// Timestamps order by wall time first and logical counter second. The textual form is
/// `<nanos>.<logical>`, where the logical part is zero-padded to ten digits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hlc {
    nanos: i64,
    logical: i32,
}

impl Hlc {
    pub fn new(nanos: i64, logical: i32) -> Self {
        Self { nanos, logical }
    }

    pub fn nanos(&self) -> i64 {
        self.nanos
    }

    pub fn logical(&self) -> i32 {
        self.logical
    }

    /// Returns the wall-clock component as a UTC timestamp.
    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.nanos)
    }
}

impl FromStr for Hlc {
    type Err = SinkError;

    /// Parses `<nanos>` or `<nanos>.<logical>`.
    fn from_str(raw: &str) -> SinkResult<Self> {
        let invalid = || {
            sink_error!(
                ErrorKind::InvalidData,
                "Invalid HLC timestamp",
                format!("`{raw}` is not of the form <nanos>.<logical>")
            )
        };

        let (nanos, logical) = match raw.split_once('.') {
            Some((nanos, logical)) => (nanos, Some(logical)),
            None => (raw, None),
        };

        let nanos = nanos.parse::<i64>().map_err(|_| invalid())?;
        let logical = match logical {
            Some(logical) if !logical.is_empty() => {
                logical.parse::<i32>().map_err(|_| invalid())?
            }
            Some(_) => return Err(invalid()),
            None => 0,
        };

        Ok(Hlc::new(nanos, logical))
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:010}", self.nanos, self.logical)
    }
}

impl Serialize for Hlc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_changefeed_timestamps() {
        let hlc: Hlc = "1586019746136571000.0000000002".parse().unwrap();

        assert_eq!(hlc, Hlc::new(1_586_019_746_136_571_000, 2));
        assert_eq!(hlc.to_string(), "1586019746136571000.0000000002");
        assert_eq!("42".parse::<Hlc>().unwrap(), Hlc::new(42, 0));
    }

    #[test]
    fn orders_by_wall_time_then_logical() {
        assert!(Hlc::new(1, 5) < Hlc::new(2, 0));
        assert!(Hlc::new(2, 0) < Hlc::new(2, 1));
    }

    #[test]
    fn rejects_garbage() {
        for raw in ["", "abc", "1.", "1.x", ".5"] {
            assert!(raw.parse::<Hlc>().is_err(), "{raw}");
        }
    }
}
