use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::load::Config;
use crate::shared::ValidationError;

const DEFAULT_DLQ_FLAG: &str = "defaultDlq";
const USER_FUNCTION_TIMEOUT_FLAG: &str = "userFunctionTimeout";
const MAX_RECURSION_DEPTH_FLAG: &str = "maxRecursionDepth";
const APPLY_PARALLELISM_FLAG: &str = "applyParallelism";
const ROW_LOCK_SHARDS_FLAG: &str = "rowLockShards";
const STALE_WRITE_RETRIES_FLAG: &str = "staleWriteRetries";
const NDJSON_BUFFER_SIZE_FLAG: &str = "ndjsonBufferSize";

/// Flag names accepted by [`SinkOptions::set`], identical to the command-line flags.
pub const OPTION_KEYS: &[&str] = &[
    DEFAULT_DLQ_FLAG,
    USER_FUNCTION_TIMEOUT_FLAG,
    MAX_RECURSION_DEPTH_FLAG,
    APPLY_PARALLELISM_FLAG,
    ROW_LOCK_SHARDS_FLAG,
    STALE_WRITE_RETRIES_FLAG,
    NDJSON_BUFFER_SIZE_FLAG,
];

/// Runtime options of the mutation-application engine.
///
/// Options are loaded from configuration files and may then be overridden by the user script
/// through `setOptions`, which funnels into [`SinkOptions::set`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SinkOptions {
    /// Dead-letter queue receiving mutations whose processing failed.
    #[serde(default = "default_dlq")]
    pub default_dlq: String,
    /// Upper bound on a single dispatch, map, or merge callback.
    #[serde(default = "default_user_function_timeout", with = "humantime_serde")]
    pub user_function_timeout: Duration,
    /// Maximum nesting depth followed for sources with `recurse` enabled.
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: usize,
    /// Number of row groups applied concurrently within a batch.
    #[serde(default = "default_apply_parallelism")]
    pub apply_parallelism: usize,
    /// Number of shards used to serialize access to individual rows.
    #[serde(default = "default_row_lock_shards")]
    pub row_lock_shards: usize,
    /// Re-read and re-merge attempts when a row changes between read and write.
    #[serde(default = "default_stale_write_retries")]
    pub stale_write_retries: u32,
    /// Maximum accepted length of a single ndjson line, in bytes.
    #[serde(default = "default_ndjson_buffer_size")]
    pub ndjson_buffer_size: usize,
}

impl SinkOptions {
    pub const DEFAULT_DLQ: &'static str = "dlq";

    pub const DEFAULT_USER_FUNCTION_TIMEOUT: Duration = Duration::from_secs(5);

    pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 32;

    pub const DEFAULT_APPLY_PARALLELISM: usize = 16;

    pub const DEFAULT_ROW_LOCK_SHARDS: usize = 256;

    pub const DEFAULT_STALE_WRITE_RETRIES: u32 = 3;

    pub const DEFAULT_NDJSON_BUFFER_SIZE: usize = 64 * 1024;

    /// Sets a single option from its flag name and string value.
    ///
    /// The value is parsed with the same rules as the command line. The resulting options are
    /// validated as a whole, and on failure the previous value is kept.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ValidationError> {
        let mut updated = self.clone();

        match key {
            DEFAULT_DLQ_FLAG => updated.default_dlq = value.trim().to_string(),
            USER_FUNCTION_TIMEOUT_FLAG => {
                updated.user_function_timeout =
                    humantime::parse_duration(value.trim()).map_err(|err| {
                        ValidationError::InvalidOptionValue {
                            key: key.to_string(),
                            value: value.to_string(),
                            reason: err.to_string(),
                        }
                    })?;
            }
            MAX_RECURSION_DEPTH_FLAG => updated.max_recursion_depth = parse_flag(key, value)?,
            APPLY_PARALLELISM_FLAG => updated.apply_parallelism = parse_flag(key, value)?,
            ROW_LOCK_SHARDS_FLAG => updated.row_lock_shards = parse_flag(key, value)?,
            STALE_WRITE_RETRIES_FLAG => updated.stale_write_retries = parse_flag(key, value)?,
            NDJSON_BUFFER_SIZE_FLAG => updated.ndjson_buffer_size = parse_flag(key, value)?,
            unknown => return Err(ValidationError::UnknownOption(unknown.to_string())),
        }

        updated.validate()?;
        *self = updated;

        Ok(())
    }

    /// Validates the options.
    ///
    /// Counts used for sizing must be non-zero and the default dead-letter queue must be named.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.default_dlq.is_empty() {
            return Err(invalid_field("default_dlq", "must not be empty"));
        }
        if self.user_function_timeout.is_zero() {
            return Err(invalid_field("user_function_timeout", "must be greater than 0"));
        }
        if self.max_recursion_depth == 0 {
            return Err(invalid_field("max_recursion_depth", "must be greater than 0"));
        }
        if self.apply_parallelism == 0 {
            return Err(invalid_field("apply_parallelism", "must be greater than 0"));
        }
        if self.row_lock_shards == 0 {
            return Err(invalid_field("row_lock_shards", "must be greater than 0"));
        }
        if self.ndjson_buffer_size == 0 {
            return Err(invalid_field("ndjson_buffer_size", "must be greater than 0"));
        }

        Ok(())
    }
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            default_dlq: default_dlq(),
            user_function_timeout: default_user_function_timeout(),
            max_recursion_depth: default_max_recursion_depth(),
            apply_parallelism: default_apply_parallelism(),
            row_lock_shards: default_row_lock_shards(),
            stale_write_retries: default_stale_write_retries(),
            ndjson_buffer_size: default_ndjson_buffer_size(),
        }
    }
}

impl Config for SinkOptions {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}

fn parse_flag<T>(key: &str, value: &str) -> Result<T, ValidationError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|err: T::Err| ValidationError::InvalidOptionValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: err.to_string(),
        })
}

fn invalid_field(field: &str, constraint: &str) -> ValidationError {
    ValidationError::InvalidFieldValue {
        field: field.to_string(),
        constraint: constraint.to_string(),
    }
}

fn default_dlq() -> String {
    SinkOptions::DEFAULT_DLQ.to_string()
}

fn default_user_function_timeout() -> Duration {
    SinkOptions::DEFAULT_USER_FUNCTION_TIMEOUT
}

fn default_max_recursion_depth() -> usize {
    SinkOptions::DEFAULT_MAX_RECURSION_DEPTH
}

fn default_apply_parallelism() -> usize {
    SinkOptions::DEFAULT_APPLY_PARALLELISM
}

fn default_row_lock_shards() -> usize {
    SinkOptions::DEFAULT_ROW_LOCK_SHARDS
}

fn default_stale_write_retries() -> u32 {
    SinkOptions::DEFAULT_STALE_WRITE_RETRIES
}

fn default_ndjson_buffer_size() -> usize {
    SinkOptions::DEFAULT_NDJSON_BUFFER_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_parses_every_recognized_flag() {
        let mut options = SinkOptions::default();

        options.set("defaultDlq", "dead").unwrap();
        options.set("userFunctionTimeout", "1m30s").unwrap();
        options.set("maxRecursionDepth", "4").unwrap();
        options.set("applyParallelism", "2").unwrap();
        options.set("rowLockShards", "8").unwrap();
        options.set("staleWriteRetries", "0").unwrap();
        options.set("ndjsonBufferSize", "1024").unwrap();

        assert_eq!(options.default_dlq, "dead");
        assert_eq!(options.user_function_timeout, Duration::from_secs(90));
        assert_eq!(options.max_recursion_depth, 4);
        assert_eq!(options.apply_parallelism, 2);
        assert_eq!(options.row_lock_shards, 8);
        assert_eq!(options.stale_write_retries, 0);
        assert_eq!(options.ndjson_buffer_size, 1024);
    }

    #[test]
    fn every_documented_key_is_accepted() {
        for key in OPTION_KEYS {
            let mut options = SinkOptions::default();
            let value = if *key == USER_FUNCTION_TIMEOUT_FLAG {
                "1s"
            } else if *key == DEFAULT_DLQ_FLAG {
                "q"
            } else {
                "1"
            };
            assert!(options.set(key, value).is_ok(), "{key} rejected");
        }
    }

    #[test]
    fn set_rejects_unknown_flags() {
        let mut options = SinkOptions::default();

        assert_eq!(
            options.set("hello", "world"),
            Err(ValidationError::UnknownOption("hello".to_string()))
        );
    }

    #[test]
    fn set_keeps_previous_value_on_failure() {
        let mut options = SinkOptions::default();

        assert!(matches!(
            options.set("applyParallelism", "many"),
            Err(ValidationError::InvalidOptionValue { .. })
        ));
        assert!(matches!(
            options.set("applyParallelism", "0"),
            Err(ValidationError::InvalidFieldValue { .. })
        ));
        assert_eq!(
            options.apply_parallelism,
            SinkOptions::DEFAULT_APPLY_PARALLELISM
        );
    }

    #[test]
    fn set_rejects_malformed_durations() {
        let mut options = SinkOptions::default();

        assert!(options.set("userFunctionTimeout", "soon").is_err());
        assert!(options.set("userFunctionTimeout", "0s").is_err());
    }
}
