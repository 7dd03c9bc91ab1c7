//! Conversions from source representations into sink types.

pub mod ndjson;
pub mod timestamp;
