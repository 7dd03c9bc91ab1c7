//! Pre-merge filter discarding mutations older than a table's deadlines.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::conversions::timestamp::coerce_timestamp;
use crate::error::{ErrorKind, SinkResult};
use crate::sink_error;
use crate::types::Document;

/// A deadline the row failed to meet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredDeadline {
    pub column: String,
    pub max_age: Duration,
    pub age: Duration,
}

/// Checks `row` against every configured deadline.
///
/// Returns the first expired deadline, if any. A missing or null deadline column never
/// expires. A value that cannot be read as a timestamp is an error.
pub fn check_deadlines(
    deadlines: &BTreeMap<String, Duration>,
    row: &Document,
    now: DateTime<Utc>,
) -> SinkResult<Option<ExpiredDeadline>> {
    for (column, max_age) in deadlines {
        let Some(value) = row.get(column) else {
            continue;
        };

        let timestamp = coerce_timestamp(value).map_err(|err| {
            sink_error!(
                ErrorKind::InvalidData,
                "Deadline column does not hold a timestamp",
                format!("column `{column}`: {}", err.detail().unwrap_or_default()),
                source: err
            )
        })?;
        let Some(timestamp) = timestamp else {
            continue;
        };

        // Timestamps in the future have no age.
        let Ok(age) = (now - timestamp).to_std() else {
            continue;
        };

        if age > *max_age {
            return Ok(Some(ExpiredDeadline {
                column: column.clone(),
                max_age: *max_age,
                age,
            }));
        }
    }

    Ok(None)
}
