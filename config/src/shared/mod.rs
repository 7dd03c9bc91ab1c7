//! Configuration types shared by the sink crates.

mod base;
mod options;

pub use base::ValidationError;
pub use options::{OPTION_KEYS, SinkOptions};
