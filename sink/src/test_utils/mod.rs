//! Utilities for testing the sink.
//!
//! Document and schema builders, scripted user functions that record how they were called, and
//! store wrappers that inject concurrent writes.

pub mod document;
pub mod functions;
pub mod schema;
pub mod store;
