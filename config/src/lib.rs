//! Shared configuration for the sink.
//!
//! Holds the runtime options that the user script may override through `setOptions`, their
//! validation rules, and the layered loader that reads options from configuration files and
//! `APP_`-prefixed environment variables.

mod environment;
mod load;
pub mod shared;

pub use environment::Environment;
pub use load::{Config, LoadConfigError, load_config, load_config_from};
